//! Unit tests for the sticky RPC client, driven against real runtimes on
//! the in-memory bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use lodestone_bus::InMemoryBus;
use lodestone_config::LodestoneConfig;
use lodestone_discovery::ServiceDiscovery;
use lodestone_kv::{KvStore, keys};
use lodestone_registry::ServiceRegistry;
use lodestone_runtime::{LifecycleState, ServiceRuntime};
use lodestone_types::{
    ErrorCode, ErrorEnvelope, GroupName, InstanceId, LeaderRecord, RpcRequest, ServiceName, Term,
};

use crate::{ClientError, StickyClient};

fn service() -> ServiceName {
    ServiceName::new("trader").unwrap()
}

fn group() -> GroupName {
    GroupName::new("default").unwrap()
}

fn kv(bus: &Arc<InMemoryBus>) -> KvStore {
    KvStore::new(bus.clone(), "service-registry", Duration::from_millis(500))
}

fn client(bus: &Arc<InMemoryBus>) -> StickyClient {
    let config = LodestoneConfig::default();
    let registry = ServiceRegistry::new(kv(bus), config.timing.registry_ttl());
    let discovery = ServiceDiscovery::new(kv(bus), registry, config.timing.discovery_cache_ttl());
    StickyClient::new(bus.clone(), discovery, &config.timing)
}

/// A single-active trader whose `whoami` handler names its own instance.
async fn trader(bus: &Arc<InMemoryBus>, instance: &str) -> ServiceRuntime {
    let id = instance.to_string();
    let mut runtime = ServiceRuntime::builder(bus.clone(), LodestoneConfig::default())
        .service_name("trader")
        .instance_id(instance)
        .single_active()
        .handler("whoami", move |_req: RpcRequest| {
            let id = id.clone();
            async move { Ok(json!({ "instance": id })) }
        })
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    runtime
}

async fn wait_until(within: Duration, mut predicate: impl FnMut() -> bool) {
    let poll = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while !predicate() {
        assert!(waited < within, "condition not reached within {within:?}");
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}

fn active_of(runtimes: &[ServiceRuntime]) -> Option<usize> {
    runtimes
        .iter()
        .position(|r| r.current_state() == LifecycleState::Active)
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn routes_to_the_active_instance() {
    let bus = Arc::new(InMemoryBus::new());
    let mut runtimes = vec![trader(&bus, "trader-a").await, trader(&bus, "trader-b").await];
    wait_until(Duration::from_secs(2), || active_of(&runtimes).is_some()).await;
    let leader_id = runtimes[active_of(&runtimes).unwrap()]
        .instance_id()
        .as_str()
        .to_string();

    let client = client(&bus);
    let reply = client
        .call_active(&service(), Some(&group()), "whoami", json!({}))
        .await
        .unwrap();

    assert_eq!(reply, json!({ "instance": leader_id }));

    for runtime in &mut runtimes {
        runtime.shutdown().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn rides_through_a_graceful_failover() {
    let bus = Arc::new(InMemoryBus::new());
    let mut runtimes = vec![trader(&bus, "trader-a").await, trader(&bus, "trader-b").await];
    wait_until(Duration::from_secs(2), || active_of(&runtimes).is_some()).await;

    let client = client(&bus);
    let first = client
        .call_active(&service(), Some(&group()), "whoami", json!({}))
        .await
        .unwrap();

    // The leader leaves; its standby peer takes over.
    let old_leader = active_of(&runtimes).unwrap();
    let mut departing = runtimes.swap_remove(old_leader);
    departing.shutdown().await.unwrap();
    let survivor_id = runtimes[0].instance_id().as_str().to_string();

    // The very next call lands on the new leader, retrying internally
    // through the handoff window.
    let second = client
        .call_active(&service(), Some(&group()), "whoami", json!({}))
        .await
        .unwrap();
    assert_eq!(second, json!({ "instance": survivor_id }));
    assert_ne!(first, second);

    runtimes[0].shutdown().await.unwrap();
}

// ============================================================================
// NOT_ACTIVE handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stale_leader_record_exhausts_to_unavailable() {
    let bus = Arc::new(InMemoryBus::new());

    // A frozen leader record pointing at an instance that is actually
    // standing by: discovery keeps resolving it, the instance keeps
    // answering NOT_ACTIVE. (A long TTL pins the pathological state for
    // the whole test.)
    let frozen = LeaderRecord::new(
        "trader.default",
        InstanceId::new("trader-b").unwrap(),
        Term::new(7),
        Utc::now(),
    );
    kv(&bus)
        .put(
            &keys::leader(&service(), &group()),
            &frozen,
            Some(Duration::from_secs(120)),
        )
        .await
        .unwrap();

    let mut b = trader(&bus, "trader-b").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.current_state(), LifecycleState::Standby);

    let client = client(&bus);
    let result = client
        .call_active(&service(), Some(&group()), "whoami", json!({}))
        .await;

    match result {
        Err(ClientError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected Unavailable, got {other:?}"),
    }

    b.shutdown().await.unwrap();
}

// ============================================================================
// Non-retryable outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn business_errors_propagate_without_retry() {
    let bus = Arc::new(InMemoryBus::new());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut runtime = ServiceRuntime::builder(bus.clone(), LodestoneConfig::default())
        .service_name("trader")
        .instance_id("trader-a")
        .single_active()
        .handler("reject", move |_req: RpcRequest| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ErrorEnvelope::validation("order quantity must be positive"))
            }
        })
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    wait_until(Duration::from_secs(2), || {
        runtime.current_state() == LifecycleState::Active
    })
    .await;

    let client = client(&bus);
    let result = client
        .call_active(&service(), Some(&group()), "reject", json!({ "qty": -1 }))
        .await;

    match result {
        Err(ClientError::Remote(envelope)) => {
            assert_eq!(envelope.code, ErrorCode::ValidationFailed);
        }
        other => panic!("expected Remote, got {other:?}"),
    }
    // Exactly one invocation: validation failures are never retried.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    runtime.shutdown().await.unwrap();
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn overall_deadline_bounds_total_wall_time() {
    let bus = Arc::new(InMemoryBus::new());

    // Many attempts allowed, tight deadline, nothing to discover: the
    // deadline must fire long before the attempts run out.
    let mut config = LodestoneConfig::default();
    config.timing.rpc_max_attempts = 100;
    let registry = ServiceRegistry::new(kv(&bus), config.timing.registry_ttl());
    let discovery = ServiceDiscovery::new(kv(&bus), registry, config.timing.discovery_cache_ttl());
    let client = StickyClient::new(bus.clone(), discovery, &config.timing);

    let started = tokio::time::Instant::now();
    let result = client
        .call_active_with_deadline(
            &service(),
            Some(&group()),
            "whoami",
            json!({}),
            Duration::from_millis(500),
        )
        .await;

    assert!(matches!(result, Err(ClientError::DeadlineExceeded(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ============================================================================
// Queue-group calls
// ============================================================================

#[tokio::test(start_paused = true)]
async fn call_any_reaches_one_plain_instance() {
    let bus = Arc::new(InMemoryBus::new());
    let mut runtime = ServiceRuntime::builder(bus.clone(), LodestoneConfig::default())
        .service_name("pricer")
        .instance_id("pricer-a")
        .handler("quote", |_req: RpcRequest| async move {
            Ok(json!({ "bid": 99.5 }))
        })
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let client = client(&bus);
    let reply = client
        .call_any(&ServiceName::new("pricer").unwrap(), "quote", json!({}))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "bid": 99.5 }));

    runtime.shutdown().await.unwrap();
}
