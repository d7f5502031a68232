use assessment_api::{config::Config, create_router, services::AppState};
use axum::Router;
use std::sync::Arc;

pub async fn create_test_app() -> Router {
    // Initialize tracing for tests
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    // Tests never talk to a real recorder; submissions stay in memory.
    std::env::set_var("SKIP_ROOT_ENV", "1");
    std::env::remove_var("RECORDER_URL");

    let config = Config::load().expect("Failed to load test configuration");

    let app_state = Arc::new(AppState::new(config).expect("Failed to initialize test app state"));

    create_router(app_state)
}
