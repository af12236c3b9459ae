use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::connection_manager::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub connection_manager: Arc<ConnectionManager>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            settings: Arc::new(settings),
            connection_manager,
            start_time: Instant::now(),
        }
    }
}
