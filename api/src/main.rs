use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod ai;
mod error;
mod middleware;
mod reconcile;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Essaylab API",
        version = "0.1.0",
        description = "Backend for leveled AI essay feedback and cross-version question flags."
    ),
    paths(
        routes::health::health_check,
        routes::flags::toggle_flag,
        routes::flags::remove_flag,
        routes::flags::list_flags,
        routes::sessions::create_session,
        routes::sessions::get_session,
        routes::sessions::get_progress,
        routes::feedback::request_feedback,
        routes::admin::trigger_reconcile,
    ),
    components(schemas(
        routes::health::HealthResponse,
        essaylab_core::error::ApiError,
        essaylab_core::flags::Flag,
        essaylab_core::flags::FlagColor,
        essaylab_core::feedback::FeedbackRequest,
        essaylab_core::feedback::FeedbackResponse,
        essaylab_core::feedback::HighlightRange,
        essaylab_core::feedback::EssayVersion,
        essaylab_core::progress::LevelState,
        essaylab_core::progress::SessionState,
        routes::flags::ToggleFlagRequest,
        routes::flags::ToggleFlagResponse,
        routes::flags::RemoveFlagResponse,
        routes::flags::FlagListResponse,
        routes::sessions::Session,
        routes::sessions::CreateSessionRequest,
        routes::sessions::LevelProgressItem,
        routes::sessions::ProgressResponse,
        reconcile::ReconcileStats,
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "essaylab_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let ai_provider = Arc::new(ai::HttpChatProvider::new(ai::AiConfig::from_env()));
    let app_state = state::AppState {
        db: pool,
        ai: ai_provider,
    };

    // Background flag reconciliation
    reconcile::spawn_scheduler(app_state.db.clone());

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-endpoint rate limiting
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::flags::router().layer(middleware::rate_limit::flags_layer()))
        .merge(routes::sessions::router().layer(middleware::rate_limit::sessions_layer()))
        .merge(routes::feedback::router().layer(middleware::rate_limit::feedback_layer()))
        .merge(routes::admin::router().layer(middleware::rate_limit::admin_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Essaylab API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
