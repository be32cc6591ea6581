use crate::{config::AppConfig, engine::TripEngine};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: TripEngine,
}

impl AppState {
    pub fn new(config: AppConfig, engine: TripEngine) -> Self {
        Self { config, engine }
    }
}
