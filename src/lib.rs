pub mod config;
pub mod ocr;
pub mod routes;
pub mod swagger;
pub mod worker;

use std::sync::Arc;

use config::Config;
use worker::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub supervisor: Arc<Supervisor>,
}
