pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use broadcast::SessionRegistry;
use config::Config;
use db::directory::SessionDirectory;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn SessionDirectory>,
    pub registry: Arc<SessionRegistry>,
}
