use std::env;

/// Default ICE server used when `STUN_URLS` is not configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug)]
pub struct Config {
    /// Connection string. An empty `DATABASE_URL` falls back to a local
    /// SQLite file so the server runs with zero external services.
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,
    /// STUN/TURN URLs handed to every peer connection the SFU creates.
    pub stun_urls: Vec<String>,
    pub is_production: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => "sqlite:hermes.db?mode=rwc".to_string(),
        };

        let stun_urls: Vec<String> = env::var("STUN_URLS")
            .unwrap_or_else(|_| DEFAULT_STUN_URL.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        Config {
            database_url,
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "dev_secret_change_in_production".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            stun_urls,
            is_production: env::var("APP_ENV").as_deref() == Ok("production"),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}
