//! Common test utilities for agent integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use hive_coordinator::{api, AppState, CoordinatorConfig, HttpBackend, MemoryKv};
use tokio::net::TcpListener;

/// A coordinator served on an ephemeral local port.
pub struct LiveCoordinator {
    pub url: String,
    pub state: Arc<AppState>,
}

impl LiveCoordinator {
    pub async fn start() -> Self {
        Self::start_with(CoordinatorConfig::default()).await
    }

    pub async fn start_with(config: CoordinatorConfig) -> Self {
        let state = Arc::new(AppState::new(
            config,
            Arc::new(MemoryKv::new()),
            Arc::new(HttpBackend::new()),
        ));
        let url = serve(api::router(state.clone())).await;
        Self { url, state }
    }

    /// Polls until `check` holds or two seconds pass.
    pub async fn wait_for(&self, check: impl Fn(&AppState) -> bool) -> bool {
        for _ in 0..40 {
            if check(&self.state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check(&self.state)
    }
}

/// Serves `app` on 127.0.0.1 and returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
