use backup_engine::BackupEngine;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<BackupEngine>,
}

impl AppState {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self { engine }
    }
}
