use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::Extension,
    http::{
        StatusCode,
        header::{ACCEPT, CONTENT_TYPE},
    },
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_sessions::{
    Expiry, MemoryStore, SessionManagerLayer,
    cookie::{SameSite, time::Duration},
};
use tracing::info;

use pollstream::config::Config;
use pollstream::events::StreamEventConsumer;
use pollstream::notify::ValkeyNotificationPublisher;
use pollstream::processor::VoteProcessor;
use pollstream::sse::poll_updates_sse;
use pollstream::startup::AppState;
use pollstream::votes::{get_vote_counts, submit_vote};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "INFO");
        }
    }
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = Config::from_env().expect("Invalid configuration");
    let app_state = AppState::new(config.clone()).await;

    // The vote processor shares the store and cache with the HTTP side but
    // rides its own Valkey connection for consuming and publishing.
    let processor_conn = pollstream::cache::init_valkey(&config.valkey_url)
        .await
        .expect("Unable to connect to Valkey");
    let consumer = StreamEventConsumer::new(processor_conn.clone(), &config.event_consumer_name)
        .await
        .expect("Unable to join vote event consumer group");
    let processor = VoteProcessor::new(
        app_state.store.clone(),
        app_state.cache.clone(),
        Arc::new(ValkeyNotificationPublisher::new(processor_conn)),
        config.event_commit_interval,
    );
    let processor_task = tokio::spawn(async move {
        processor.run(Box::new(consumer)).await;
    });

    let session_store = MemoryStore::default();

    let app = Router::new()
        .route("/vote/submit", post(submit_vote))
        .route("/vote/:poll_id", get(get_vote_counts))
        .route("/poll/:poll_id/updates", get(poll_updates_sse))
        .layer(Extension(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true)
                .allow_methods([
                    axum::http::Method::POST,
                    axum::http::Method::GET,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([CONTENT_TYPE, ACCEPT]),
        )
        .layer(
            SessionManagerLayer::new(session_store)
                .with_name("pollstream")
                .with_same_site(SameSite::Lax)
                .with_secure(false) // TODO: true once this runs behind HTTPS
                .with_expiry(Expiry::OnInactivity(Duration::seconds(3600))),
        )
        .fallback(handler_404);

    let addr: SocketAddr = config.bind_addr.parse().expect("Invalid BIND_ADDR");
    info!("listening on {addr}");

    let listener = TcpListener::bind(addr)
        .await
        .expect("Unable to spawn tcp listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    processor_task.abort();
    app_state.fanout.shutdown().await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "nothing to see here")
}
