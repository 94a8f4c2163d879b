pub mod admin;
pub mod api;
pub mod checkout;
pub mod config;
pub mod db;
pub mod docs;
pub mod errors;
pub mod mailer;
pub mod models;
pub mod tokens;
pub mod ws;

use actix::Addr;
use std::sync::Arc;

use crate::api::stripe_client::PaymentGateway;
use crate::db::Store;
use crate::mailer::Mailer;
use crate::ws::WsHub;

/// Everything a handler needs, injected once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub mailer: Arc<dyn Mailer>,
    pub ws_hub: Addr<WsHub>,
    pub stripe_secret: String,
    pub frontend_url: String,
}
