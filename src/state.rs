use crate::services::deployments::DeploymentManager;
use axum::extract::FromRef;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub deployments: Arc<DeploymentManager>,
}

impl FromRef<AppState> for Arc<DeploymentManager> {
    fn from_ref(state: &AppState) -> Arc<DeploymentManager> {
        state.deployments.clone()
    }
}
