//! Process-wide composition root. The coordinator, health monitor, and
//! metrics manager are built once at startup and passed by reference;
//! nothing in the crate reaches for a global.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Settings;
use crate::health::HealthMonitor;
use crate::metrics::MetricsManager;
use crate::pipeline::PipelineCoordinator;

pub struct ServerContext {
    pub settings: Arc<Settings>,
    pub coordinator: Arc<PipelineCoordinator>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsManager>,
}

impl ServerContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let save_path = settings
            .enable_metrics
            .then(|| PathBuf::from(&settings.metrics_save_path));
        let metrics = Arc::new(MetricsManager::new(save_path));
        let health = Arc::new(HealthMonitor::new(&settings));
        let coordinator = Arc::new(PipelineCoordinator::new(settings.clone(), metrics.clone()));

        Arc::new(Self {
            settings,
            coordinator,
            health,
            metrics,
        })
    }
}
