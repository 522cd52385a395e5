use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use hermes_server::config::Config;
use hermes_server::db::{self, DbBackend};
use hermes_server::sfu::RoomRegistry;
use hermes_server::state::AppState;
use hermes_server::store::{RealtimeStore, SqlStore};
use hermes_server::websocket::{self, Hub};
use hermes_server::handlers;

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "hermes_server=info,tower_http=info,sqlx=warn,webrtc=warn"
            .parse()
            .unwrap()
    });

    let config = Config::from_env();

    if config.is_production {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 Hermes Server starting...");

    // Create database connection pool and run migrations.
    let backend = DbBackend::from_url(&config.database_url);
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    db::migrate(&pool, backend)
        .await
        .expect("Failed to run database migrations");
    info!("✅ Database migrations applied");

    db::health_check(&pool)
        .await
        .expect("Database health check failed");
    info!("✅ Database health check passed");

    // Realtime plane: one hub event loop and one SFU registry per process.
    let store: Arc<dyn RealtimeStore> = Arc::new(SqlStore::new(pool.clone()));
    let hub = Hub::spawn(store.clone());
    let sfu = RoomRegistry::new(hub.clone(), store.clone(), config.stun_urls.clone());
    info!("✅ Gateway hub and SFU registry started");

    let app_state = AppState {
        pool,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
        hub,
        sfu,
        store,
    };

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // ── Rate limiting ─────────────────────────────────────────────────────────
    // Global limit: 10 requests/second per IP, burst of 20.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("Invalid global governor configuration"),
    );

    // Stricter limit for authentication endpoints: 2 requests/second per IP,
    // burst of 5. Nested into a sub-router so `.route_layer()` applies only
    // to these three routes.
    let auth_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(5)
            .finish()
            .expect("Invalid auth governor configuration"),
    );

    let auth_router = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh_token))
        .route_layer(GovernorLayer {
            config: auth_governor_conf,
        });

    // Build router
    let app = Router::new()
        // Health check + metrics
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        // Auth routes (stricter per-IP rate limit, nested via sub-router)
        .merge(auth_router)
        // User routes (protected)
        .route("/users/@me", get(handlers::users::get_current_user))
        .route("/users/@me", patch(handlers::users::update_current_user))
        // Server routes (protected)
        .route("/servers", post(handlers::servers::create_server))
        .route("/servers", get(handlers::servers::list_servers))
        .route("/servers/:id", get(handlers::servers::get_server))
        .route("/servers/:id", patch(handlers::servers::update_server))
        .route("/servers/:id", delete(handlers::servers::delete_server))
        .route("/servers/:id/join", post(handlers::servers::join_server))
        .route(
            "/servers/:id/leave",
            delete(handlers::servers::leave_server),
        )
        .route("/servers/:id/members", get(handlers::servers::list_members))
        // Channel routes (protected, nested under server)
        .route(
            "/servers/:id/channels",
            post(handlers::channels::create_channel),
        )
        .route(
            "/servers/:id/channels",
            get(handlers::channels::list_channels),
        )
        .route(
            "/servers/:id/channels/:channel_id",
            get(handlers::channels::get_channel),
        )
        .route(
            "/servers/:id/channels/:channel_id",
            patch(handlers::channels::update_channel),
        )
        .route(
            "/servers/:id/channels/:channel_id",
            delete(handlers::channels::delete_channel),
        )
        // Message routes (protected, nested under channel)
        .route(
            "/channels/:channel_id/messages",
            post(handlers::messages::create_message),
        )
        .route(
            "/channels/:channel_id/messages",
            get(handlers::messages::list_messages),
        )
        .route(
            "/messages/:message_id",
            patch(handlers::messages::update_message),
        )
        .route(
            "/messages/:message_id",
            delete(handlers::messages::delete_message),
        )
        // Voice roster (protected, nested under channel)
        .route(
            "/channels/:channel_id/voice",
            get(handlers::voice::list_voice_participants),
        )
        // WebSocket gateway — chat events, presence, and WebRTC signaling
        // ride the same connection.
        .route("/ws", get(websocket::websocket_handler))
        // ── Global rate limit (10 req/s per IP, burst 20) ──────────────────
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Prometheus + tracing + CORS ────────────────────────────────────
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let addr = config.server_addr();
    info!("🎧 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // in request extensions, needed by:
    //  - GovernorLayer's PeerIpKeyExtractor (per-IP rate limiting)
    //  - require_loopback middleware on /metrics
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server failed to start");
}
