use std::sync::Arc;

use application::{Hub, PermissionProvider, TodoUseCases};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub todos: Arc<dyn TodoUseCases>,
    pub hub: Hub,
    pub permissions: Arc<dyn PermissionProvider>,
    pub jwt_service: Arc<JwtService>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        todos: Arc<dyn TodoUseCases>,
        hub: Hub,
        permissions: Arc<dyn PermissionProvider>,
        jwt_service: Arc<JwtService>,
    ) -> Self {
        Self {
            todos,
            hub,
            permissions,
            jwt_service,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
