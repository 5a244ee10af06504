//! CreditGate API Server
//!
//! Credit-metered proxy in front of a chat completion service, fed by PayPal
//! payment webhooks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use creditgate_api::{create_router, AppState, Config};
use creditgate_billing::{LogNotifier, NotificationDispatcher, Notifier, SendGridNotifier};
use creditgate_shared::{
    create_pool, run_migrations, AccountStore, InMemoryAccountStore, PgAccountStore,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,creditgate_api=debug,creditgate_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CreditGate API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!("Configuration loaded");
    for missing in config.missing_components() {
        tracing::warn!("Not configured: {}", missing);
    }

    // Account store: Postgres when configured, otherwise in memory
    let store: Arc<dyn AccountStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(url, config.database_name.as_deref())
                .await
                .context("failed to connect to database")?;
            tracing::info!("Database connection established");

            tracing::info!("Running database migrations...");
            run_migrations(&pool).await.context("failed to run migrations")?;
            tracing::info!("Database migrations applied");

            Arc::new(PgAccountStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set - using in-memory account store");
            Arc::new(InMemoryAccountStore::new())
        }
    };

    let http_client = reqwest::Client::new();

    // Activation email delivery runs on its own task
    let notifier: Arc<dyn Notifier> = match config.email_config() {
        Some(email) => {
            tracing::info!(from = %email.from_address, "SendGrid email delivery enabled");
            Arc::new(SendGridNotifier::new(email, http_client.clone()))
        }
        None => Arc::new(LogNotifier),
    };
    let (notifications, _dispatcher) = NotificationDispatcher::spawn(notifier);

    // Create application state
    let state = AppState::new(store, config.clone(), notifications, http_client)?;

    // Build CORS layer; no ALLOWED_ORIGINS means any origin (browser extensions)
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            axum::http::HeaderName::from_static("x-admin-token"),
        ]);
    let cors = if config.allowed_origins.is_empty() {
        tracing::info!("CORS allows any origin");
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        tracing::info!(
            allowed_origins = ?origins,
            "CORS configured with {} allowed origins",
            origins.len()
        );
        cors.allow_origin(AllowOrigin::list(origins))
    };

    // Build the router
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;
    tracing::info!("Starting server on {}", addr);
    tracing::info!("PayPal webhook: POST http://{}/webhook/paypal", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
