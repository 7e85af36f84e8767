//! Background health loop.
//!
//! Every five seconds: prune registry records whose containers are gone,
//! probe each deployment's `/health`, and feed the VRAM rings. Failures are
//! logged and swallowed; the loop never exits.

use crate::aggregate::Collector;
use crate::docker::live_vllm_containers;
use metrics::gauge;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(collector: Arc<Collector>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("health loop started (5 second cadence)");
        loop {
            tokio::time::sleep(TICK_INTERVAL).await;
            tick(&collector).await;
        }
    })
}

async fn tick(collector: &Collector) {
    let live = match live_vllm_containers(collector.runtime.as_ref()).await {
        Ok(live) => live,
        Err(e) => {
            warn!(error = %e, "health tick skipped: runtime listing failed");
            return;
        }
    };
    gauge!("gpuplane_models_running").set(live.len() as f64);

    let running: HashSet<String> = live.iter().map(|c| c.container_name.clone()).collect();
    collector.registry.prune_stale(&running);

    for container in &live {
        if collector.scraper.health(container.port).await {
            debug!(model = %container.model_id, port = container.port, "health check ok");
        } else {
            warn!(model = %container.model_id, port = container.port, "health check failed");
        }
    }

    collector.sample_vram_rings().await;
}
