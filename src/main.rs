mod db;
mod event;
mod presence;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::store::PgStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let state = state::AppState::new(Arc::new(PgStore::new(pool)));

    // Background demotion of stale sessions. Scoped to the server's lifetime.
    let reaper = services::reaper::spawn_reaper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "slidecast listening");
    axum::serve(listener, app).await.expect("server failed");
    reaper.abort();
}
