//! HTTP routes

mod accounts;
mod activation;
mod admin;
mod completion;
mod health;
mod webhook;


use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/register", post(accounts::register))
        .route("/balance", post(accounts::balance))
        .route("/check-expiry", post(accounts::check_expiry))
        .route("/activate", post(activation::activate))
        .route("/openai", post(completion::openai))
        .route("/admin/payments", get(admin::payments));

    if state.config.enable_manual_activation {
        api = api.route("/manual-activate", post(activation::manual_activate));
    }

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/webhook/paypal", post(webhook::paypal))
        .nest("/api", api)
        .with_state(state)
}
