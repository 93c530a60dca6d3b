pub mod cloud;
pub mod config;
pub mod dto;
pub mod evaluator;
pub mod vm_worker;
pub mod vmss_manager;
pub mod website;

#[cfg(test)]
mod vmss_manager_tests;

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::RunnerRegistry;
use tokio::net::TcpListener;

use crate::cloud::CloudClient;
use crate::cloud::mock::MockCloud;
use crate::config::Limits;
use crate::evaluator::Evaluator;

/// Wire the queuer together and serve until a listener fails.
///
/// The real control plane sits behind [`CloudClient`]; without credentials
/// this runs against the in-memory cloud, which still exercises the whole
/// scheduling pipeline.
pub async fn main(judge_addr: SocketAddr, website_addr: SocketAddr) {
    let registry = Arc::new(RunnerRegistry::new());
    let limits = Limits::from_env();
    tracing::info!(?limits, "starting judge queuer");

    let (cloud, _tracker) = MockCloud::new();
    let cloud: Arc<dyn CloudClient> = Arc::new(cloud);

    let evaluator = match Evaluator::new(cloud, registry.clone(), limits).await {
        Ok(evaluator) => evaluator,
        Err(err) => {
            tracing::error!(error = %err, "evaluator initialization failed");
            return;
        }
    };

    let judge_listener = match TcpListener::bind(judge_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %judge_addr, error = %err, "cannot bind runner listener");
            return;
        }
    };
    let website_listener = match TcpListener::bind(website_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %website_addr, error = %err, "cannot bind website listener");
            return;
        }
    };

    tokio::select! {
        result = protocol::judge::serve(judge_listener, registry) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "runner listener failed");
            }
        }
        result = website::serve(website_listener, evaluator) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "website listener failed");
            }
        }
    }
}
