//! Campaign walk-through with the in-memory store.
//!
//! Runs a ten-repository campaign in batches of three, two batches at a time,
//! with a simulated substrate that finishes each execution shortly after it
//! is created. The last batch fails to show the failure path.
//!
//! ```text
//! RUST_LOG=shoal=info cargo run --example campaign_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal::*;
use shoal_testkit::{CampaignBuilder, NAMESPACE, SubstrateSimulator, repositories};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shoal=info")),
        )
        .init();

    let store = Arc::new(InMemoryObjectStore::new());
    let discovery = Arc::new(StaticDiscovery::new());
    let config = ControllerConfig::default()
        .with_worker_count(4)
        .with_resync_interval(200)
        .with_requeue(RequeuePolicy {
            after_admission_secs: 1,
            while_active_secs: 1,
            idle_secs: 5,
            max_terminal_wait_secs: 5,
        });

    let runtime = ControllerRuntimeBuilder::new(config)
        .with_store(store.clone())
        .with_discovery(discovery.clone())
        .build()?;

    let campaign = CampaignBuilder::new("dependency-refresh")
        .strategy(PartitionStrategy::FixedBatchSize, 3)
        .parallelism(2)
        .base_config(json!({"platform": "github", "dryRun": false}))
        .build();
    discovery.set(campaign.key(), repositories(10));
    store.create(&campaign).await?;

    let mut events = runtime.events().subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[event] {} {}", event.meta.entity, event.payload.label());
        }
    });

    runtime.start().await?;

    let substrate = SubstrateSimulator::new(store.clone());
    let filter = ListFilter::in_namespace(NAMESPACE).with_label(CAMPAIGN_LABEL, &campaign.metadata.name);
    loop {
        let units = store.list::<WorkUnit>(&filter).await?;
        for unit in units.iter().filter(|u| u.is_live()) {
            let Some(execution) = &unit.status.execution_ref else {
                continue;
            };
            if unit.spec.batch_index == 3 {
                substrate.mark_failed(execution, "rate limited by forge", Utc::now()).await;
            } else {
                substrate.mark_succeeded(execution, Utc::now()).await;
            }
        }
        if units.len() == 4 && units.iter().all(|u| !u.is_live()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for unit in store.list::<WorkUnit>(&filter).await? {
        println!(
            "{:<32} {:<10} {:?}",
            unit.metadata.name,
            unit.phase(),
            unit.spec.repositories
        );
    }
    let campaign: Campaign = store.get(&campaign.key()).await?;
    println!(
        "batches={} active={}",
        campaign.status.batch_count, campaign.status.active_work_units
    );

    runtime.shutdown().await
}
