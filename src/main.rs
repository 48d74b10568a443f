// Microclima station ingest & forecast service v0.1
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use db::store::SeriesStore;
use routes::observations::AppState;
use services::ingest::{IngestConfig, Ingestor, ProcessState, SharedProcessState};
use services::model::{AdaptationArtifact, AdapterHead, ForecastAdapter};
use services::normalize::Normalizer;
use services::upstream::StationClient;
use services::window::WindowBuilder;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// Microclima API — OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Microclima API",
        version = "0.1.0",
        description = "Hyper-local weather observation and short-horizon microclimate \
            forecasting for a single station. Ingests station samples on a fixed cadence, \
            persists them as an append-only series, and issues calibrated short-term \
            predictions by adapting a pretrained foundation model to the station's history.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Observations", description = "Observation series reads"),
        (name = "Predictions", description = "Latest issued predictions"),
        (name = "Ingest", description = "Background ingest loop status"),
    ),
    paths(
        routes::health::health_check,
        routes::observations::get_observation_range,
        routes::observations::get_latest_observation,
        routes::predictions::get_latest_predictions,
        routes::ingest::get_ingest_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::observations::ObservationResponse,
            routes::predictions::PredictionResponse,
            routes::predictions::PredictionSetResponse,
            services::ingest::ProcessState,
            services::ingest::IngestCycleResult,
            services::ingest::CycleOutcome,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "microclima=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    config
        .validate()
        .unwrap_or_else(|e| panic!("Invalid configuration: {e}"));

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    // Load the adaptation artifact; an invalid artifact is a configuration
    // failure and stops startup like any other.
    let artifact = AdaptationArtifact::load(&config.model_artifact_path)
        .unwrap_or_else(|e| panic!("Invalid model artifact: {e}"));
    if artifact.horizons_minutes != config.horizons_minutes {
        panic!(
            "Artifact horizons {:?} do not match configured horizons {:?}",
            artifact.horizons_minutes, config.horizons_minutes,
        );
    }
    if artifact.window_slots != config.window.slot_count() {
        panic!(
            "Artifact expects {}-slot windows, lookback configures {}",
            artifact.window_slots,
            config.window.slot_count(),
        );
    }
    tracing::info!(
        "Loaded adaptation artifact {} ({} horizons, {}-slot windows)",
        artifact.model_version,
        artifact.horizons_minutes.len(),
        artifact.window_slots,
    );

    // Assemble the pipeline
    let store = SeriesStore::new(pool.clone());
    let client = StationClient::new(
        &config.upstream_base_url,
        &config.upstream_user_agent,
        config.retry.clone(),
    );
    let normalizer = Normalizer::new(&config.station_id, config.max_clock_skew_secs);
    let window_builder = WindowBuilder::new(store.clone(), config.window.clone());
    let model = Arc::new(AdapterHead::from_artifact(&artifact));
    let adapter = ForecastAdapter::new(model, artifact, config.inference_timeout_ms)
        .unwrap_or_else(|e| panic!("Invalid model artifact: {e}"));

    let ingestor = Ingestor::new(
        store,
        client,
        normalizer,
        window_builder,
        adapter,
        IngestConfig {
            station_id: config.station_id.clone(),
            poll_interval_secs: config.poll_interval_secs,
            backfill_lookback_hours: config.backfill_lookback_hours,
        },
    );

    // Spawn the background ingest/forecast loop with explicit shared state
    let process_state: SharedProcessState =
        Arc::new(RwLock::new(ProcessState::new(&config.station_id)));
    tokio::spawn(ingestor.run(process_state.clone()));

    // Build shared state for the read-only series endpoints
    let app_state = AppState {
        pool,
        station_id: config.station_id.clone(),
    };

    // CORS — read-only API, restrict methods to GET
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any);

    // Build router
    // Series routes (health included) use AppState; the status route uses
    // the shared process state.
    let series_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/observations/range",
            get(routes::observations::get_observation_range),
        )
        .route(
            "/api/v1/observations/latest",
            get(routes::observations::get_latest_observation),
        )
        .route(
            "/api/v1/predictions/latest",
            get(routes::predictions::get_latest_predictions),
        )
        .with_state(app_state);

    let status_routes = Router::new()
        .route("/api/v1/ingest/status", get(routes::ingest::get_ingest_status))
        .with_state(process_state);

    let app = Router::new()
        .merge(series_routes)
        .merge(status_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
