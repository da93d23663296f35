//! Runtime integration tests for the shoal controller runtime.
//!
//! Drives whole campaigns through `ControllerRuntime` with a simulated
//! execution substrate and checks the parallelism ceiling, event-driven
//! admission and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep, timeout};

use shoal::{
    CAMPAIGN_LABEL, ControllerConfig, ControllerRuntime, ControllerRuntimeBuilder,
    InMemoryObjectStore, ListFilter, ObjectKey, ObjectStore, ObjectStoreExt, PartitionStrategy,
    ReconcileTarget, RequeuePolicy, Resource, StaticDiscovery, WorkUnit, WorkUnitPhase,
};
use shoal_testkit::{CampaignBuilder, NAMESPACE, SubstrateSimulator, repositories};

struct Fixture {
    runtime: ControllerRuntime,
    store: Arc<InMemoryObjectStore>,
    discovery: Arc<StaticDiscovery>,
    substrate: SubstrateSimulator,
}

fn fixture() -> Fixture {
    let config = ControllerConfig::default()
        .with_worker_count(4)
        .with_resync_interval(50)
        .with_requeue(RequeuePolicy {
            after_admission_secs: 1,
            while_active_secs: 1,
            idle_secs: 1,
            max_terminal_wait_secs: 1,
        });
    let store = Arc::new(InMemoryObjectStore::new());
    let discovery = Arc::new(StaticDiscovery::new());
    let runtime = ControllerRuntimeBuilder::new(config)
        .with_store(store.clone())
        .with_discovery(discovery.clone())
        .build()
        .expect("runtime build failed");
    let substrate = SubstrateSimulator::new(store.clone());

    Fixture {
        runtime,
        store,
        discovery,
        substrate,
    }
}

async fn units_of(store: &InMemoryObjectStore, campaign: &str) -> Vec<WorkUnit> {
    let filter = ListFilter::in_namespace(NAMESPACE).with_label(CAMPAIGN_LABEL, campaign);
    store.list::<WorkUnit>(&filter).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_completes_campaign_within_ceiling() {
    let f = fixture();
    let campaign = CampaignBuilder::new("nightly")
        .strategy(PartitionStrategy::FixedBatchSize, 1)
        .parallelism(2)
        .build();
    f.discovery.set(campaign.key(), repositories(4));
    f.store.create(&campaign).await.unwrap();

    f.runtime.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let units = units_of(&f.store, "nightly").await;
        let live = units.iter().filter(|u| u.is_live()).count();
        assert!(live <= 2, "{live} live work units exceed the ceiling");

        if units.len() == 4 && units.iter().all(|u| u.phase() == WorkUnitPhase::Succeeded) {
            break;
        }
        for unit in units.iter().filter(|u| u.is_live()) {
            if let Some(execution) = &unit.status.execution_ref {
                f.substrate.mark_succeeded(execution, Utc::now()).await;
            }
        }

        assert!(Instant::now() < deadline, "campaign did not complete in time");
        sleep(Duration::from_millis(20)).await;
    }

    let mut indices: Vec<_> = units_of(&f.store, "nightly")
        .await
        .iter()
        .map(|u| u.spec.batch_index)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    timeout(Duration::from_secs(5), f.runtime.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();
}

#[tokio::test]
async fn admission_event_enqueues_work_unit() {
    let f = fixture();
    let campaign = CampaignBuilder::new("weekly").build();
    f.discovery.set(campaign.key(), repositories(2));
    f.store.create(&campaign).await.unwrap();

    let mut rx = f.runtime.events().subscribe_events();
    f.runtime
        .reconcile_once(&ReconcileTarget::Campaign(campaign.key()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload.label(), "admitted");
    assert_eq!(event.meta.campaign, campaign.key());
    assert_eq!(event.meta.entity, ObjectKey::new(NAMESPACE, "weekly-batch-0"));
}

#[tokio::test]
async fn store_is_shared_with_runtime() {
    let f = fixture();
    let shared: Arc<dyn ObjectStore> = f.runtime.store();
    let campaign = CampaignBuilder::new("daily").build();
    shared.create(&campaign).await.unwrap();
    assert_eq!(f.store.count(shoal::Campaign::KIND), 1);
}

#[tokio::test]
async fn shutdown_is_prompt_with_queued_work() {
    let f = fixture();
    for i in 0..16 {
        f.runtime
            .queue()
            .add_after(ReconcileTarget::WorkUnit(ObjectKey::new(NAMESPACE, format!("u-{i}"))), Duration::from_secs(60));
    }
    f.runtime.start().await.unwrap();

    let result = timeout(Duration::from_secs(5), f.runtime.shutdown()).await;
    assert!(result.is_ok(), "shutdown did not complete within 5 seconds");
    assert!(f.runtime.shutdown_token().is_cancelled());
}
