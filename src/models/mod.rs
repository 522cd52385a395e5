use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, FromRow, Row};
use strum::{Display, EnumString};

// ============================================================================
// Snowflake IDs
// ============================================================================

/// Process-wide snowflake generator. The instance component is fixed at 0;
/// partitioning across nodes is future work, so a single instance suffices.
static ID_GENERATOR: Lazy<std::sync::Mutex<snowflaked::Generator>> =
    Lazy::new(|| std::sync::Mutex::new(snowflaked::Generator::new(0)));

/// Generate a time-sortable 64-bit ID.
///
/// Snowflakes are monotonically increasing, which `list_messages` relies on:
/// paginating on `id <` is equivalent to paginating on creation time.
pub fn generate_id() -> u64 {
    ID_GENERATOR
        .lock()
        .expect("ID generator lock poisoned")
        .generate()
}

/// Serialize a `u64` ID as a decimal string and parse it back.
///
/// JSON numbers lose precision above 2^53 in JavaScript clients, so every ID
/// crosses the wire as a string.
pub mod id_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(Error::custom)
    }
}

/// `Option<u64>` variant of [`id_str`] for envelope fields that may be absent.
pub mod id_str_opt {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        id: &Option<u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.collect_str(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| s.parse().map_err(Error::custom)).transpose()
    }
}

// ============================================================================
// AnyRow decoding helpers
// ============================================================================
//
// `sqlx::AnyPool` only decodes primitive types natively. IDs are stored as
// BIGINT and decode as i64; timestamps are stored as RFC 3339 TEXT written by
// the application, so both Postgres and SQLite return the same shape.

fn get_id(row: &AnyRow, col: &str) -> Result<u64, sqlx::Error> {
    let raw: i64 = row.try_get(col)?;
    Ok(raw as u64)
}

fn get_opt_id(row: &AnyRow, col: &str) -> Result<Option<u64>, sqlx::Error> {
    let raw: Option<i64> = row.try_get(col)?;
    Ok(raw.map(|v| v as u64))
}

fn get_datetime(row: &AnyRow, col: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(col)?;
    parse_datetime(&raw).map_err(|e| sqlx::Error::Decode(e.into()))
}

fn get_opt_datetime(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|v| parse_datetime(&v).map_err(|e| sqlx::Error::Decode(e.into())))
        .transpose()
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("cannot parse timestamp {raw:?}: {e}"))
}

/// The timestamp format every INSERT/UPDATE binds.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelType {
    Text,
    Voice,
}

/// Presence states, driven exclusively by the hub's debounce logic:
/// `online` on first live connection, `away` the moment the last connection
/// drops, `offline` once the 60-second grace window lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for User {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(User {
            id: get_id(row, "id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            avatar_url: row.try_get("avatar_url")?,
            created_at: get_datetime(row, "created_at")?,
            updated_at: get_datetime(row, "updated_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    #[serde(with = "id_str")]
    pub id: u64,
    pub username: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        UserDto {
            id: user.id,
            username: user.username,
            email: user.email,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
        }
    }
}

/// The subset of a user broadcast inside voice-state events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(with = "id_str")]
    pub id: u64,
    pub name: String,
    pub avatar_url: Option<String>,
}

// ============================================================================
// Session Models
// ============================================================================

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub user_id: u64,
    pub refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for Session {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Session {
            id: get_id(row, "id")?,
            user_id: get_id(row, "user_id")?,
            refresh_token_hash: row.try_get("refresh_token_hash")?,
            expires_at: get_datetime(row, "expires_at")?,
            created_at: get_datetime(row, "created_at")?,
        })
    }
}

// ============================================================================
// Server Models
// ============================================================================

#[derive(Debug, Clone)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub owner_id: u64,
    pub icon_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for Server {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Server {
            id: get_id(row, "id")?,
            name: row.try_get("name")?,
            owner_id: get_id(row, "owner_id")?,
            icon_url: row.try_get("icon_url")?,
            created_at: get_datetime(row, "created_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ServerDto {
    #[serde(with = "id_str")]
    pub id: u64,
    pub name: String,
    #[serde(with = "id_str")]
    pub owner_id: u64,
    pub icon_url: Option<String>,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServerMember {
    pub user_id: u64,
    pub server_id: u64,
    pub joined_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for ServerMember {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(ServerMember {
            user_id: get_id(row, "user_id")?,
            server_id: get_id(row, "server_id")?,
            joined_at: get_datetime(row, "joined_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub user_id: u64,
    pub username: String,
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for MemberRow {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(MemberRow {
            user_id: get_id(row, "user_id")?,
            username: row.try_get("username")?,
            avatar_url: row.try_get("avatar_url")?,
            joined_at: get_datetime(row, "joined_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MemberDto {
    #[serde(with = "id_str")]
    pub user_id: u64,
    pub username: String,
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl From<MemberRow> for MemberDto {
    fn from(row: MemberRow) -> Self {
        MemberDto {
            user_id: row.user_id,
            username: row.username,
            avatar_url: row.avatar_url,
            joined_at: row.joined_at,
        }
    }
}

// ============================================================================
// Channel Models
// ============================================================================

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u64,
    pub server_id: u64,
    pub name: String,
    pub kind: ChannelType,
    pub topic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for Channel {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(Channel {
            id: get_id(row, "id")?,
            server_id: get_id(row, "server_id")?,
            name: row.try_get("name")?,
            kind: kind
                .parse()
                .map_err(|e: strum::ParseError| sqlx::Error::Decode(Box::new(e)))?,
            topic: row.try_get("topic")?,
            created_at: get_datetime(row, "created_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelDto {
    #[serde(with = "id_str")]
    pub id: u64,
    #[serde(with = "id_str")]
    pub server_id: u64,
    pub name: String,
    pub kind: ChannelType,
    pub topic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Channel> for ChannelDto {
    fn from(channel: Channel) -> Self {
        ChannelDto {
            id: channel.id,
            server_id: channel.server_id,
            name: channel.name,
            kind: channel.kind,
            topic: channel.topic,
            created_at: channel.created_at,
        }
    }
}

// ============================================================================
// Message Models
// ============================================================================

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub channel_id: u64,
    pub author_id: Option<u64>,
    pub content: String,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, AnyRow> for Message {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Message {
            id: get_id(row, "id")?,
            channel_id: get_id(row, "channel_id")?,
            author_id: get_opt_id(row, "author_id")?,
            content: row.try_get("content")?,
            edited_at: get_opt_datetime(row, "edited_at")?,
            deleted: row.try_get("deleted")?,
            created_at: get_datetime(row, "created_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    #[serde(with = "id_str")]
    pub id: u64,
    #[serde(with = "id_str")]
    pub channel_id: u64,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub author_id: Option<u64>,
    pub content: String,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageDto {
    fn from(message: Message) -> Self {
        MessageDto {
            id: message.id,
            channel_id: message.channel_id,
            author_id: message.author_id,
            content: message.content,
            edited_at: message.edited_at,
            created_at: message.created_at,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
