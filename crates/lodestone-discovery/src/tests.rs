//! Unit tests for discovery and the sticky cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use lodestone_bus::InMemoryBus;
use lodestone_kv::{KvStore, keys};
use lodestone_registry::ServiceRegistry;
use lodestone_types::{
    GroupName, InstanceId, InstanceStatus, LeaderRecord, ServiceInstance, ServiceName, Term,
};

use crate::{DiscoveryError, ServiceDiscovery};

const BUCKET: &str = "service-registry";
const CACHE_TTL: Duration = Duration::from_secs(5);

struct Fixture {
    bus: Arc<InMemoryBus>,
    kv: KvStore,
    registry: ServiceRegistry,
    discovery: ServiceDiscovery,
}

fn fixture() -> Fixture {
    let bus = Arc::new(InMemoryBus::new());
    let kv = KvStore::new(bus.clone(), BUCKET, Duration::from_millis(500));
    let registry = ServiceRegistry::new(kv.clone(), Duration::from_secs(3));
    let discovery = ServiceDiscovery::new(kv.clone(), registry.clone(), CACHE_TTL);
    Fixture {
        bus,
        kv,
        registry,
        discovery,
    }
}

fn service() -> ServiceName {
    ServiceName::new("trader").unwrap()
}

fn group() -> GroupName {
    GroupName::new("default").unwrap()
}

fn leader_record(holder: &str, term: u64) -> LeaderRecord {
    LeaderRecord::new(
        "trader.default",
        InstanceId::new(holder).unwrap(),
        Term::new(term),
        Utc::now(),
    )
}

fn instance(id: &str, status: InstanceStatus, sticky: Option<&str>) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        service(),
        InstanceId::new(id).unwrap(),
        "1.0.0",
        Utc::now(),
    );
    instance.status = status;
    if let Some(sticky) = sticky {
        instance.sticky_group = Some(GroupName::new(sticky).unwrap());
    }
    instance
}

/// Lets the invalidation watch drain pending events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ============================================================================
// Leader-record path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn group_lookup_follows_the_leader_record() {
    let f = fixture();
    f.kv.put(
        &keys::leader(&service(), &group()),
        &leader_record("trader-a", 0),
        None,
    )
    .await
    .unwrap();

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());
}

#[tokio::test(start_paused = true)]
async fn missing_leader_record_is_not_found() {
    let f = fixture();
    let result = f.discovery.find_active(&service(), Some(&group())).await;
    assert!(matches!(
        result,
        Err(DiscoveryError::NoActiveInstance { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn cached_resolution_survives_a_short_partition() {
    let f = fixture();
    f.kv.put(
        &keys::leader(&service(), &group()),
        &leader_record("trader-a", 0),
        None,
    )
    .await
    .unwrap();

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());

    // Transport drops; the cached resolution keeps answering.
    f.bus.set_connected(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());

    // Once the cache TTL passes, discovery must consult the bus again and
    // surfaces the transport failure instead of stale state.
    tokio::time::sleep(CACHE_TTL).await;
    let result = f.discovery.find_active(&service(), Some(&group())).await;
    assert!(matches!(result, Err(DiscoveryError::Kv(_))));
}

// ============================================================================
// Invalidation and suppression
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalidated_instance_is_withheld_while_the_record_is_frozen() {
    let f = fixture();
    // A leader that died without cleanup: record frozen until its TTL.
    f.kv.put(
        &keys::leader(&service(), &group()),
        &leader_record("trader-a", 0),
        None,
    )
    .await
    .unwrap();
    settle().await;

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());

    // The caller saw NOT_ACTIVE from trader-a and reports it.
    f.discovery.invalidate(&service(), Some(&group()));

    // Same frozen record: discovery refuses to hand the instance out.
    let result = f.discovery.find_active(&service(), Some(&group())).await;
    assert!(matches!(
        result,
        Err(DiscoveryError::NoActiveInstance { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn suppression_lifts_when_the_record_moves() {
    let f = fixture();
    let leader_key = keys::leader(&service(), &group());
    f.kv.put(&leader_key, &leader_record("trader-a", 0), None)
        .await
        .unwrap();
    settle().await;

    f.discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    f.discovery.invalidate(&service(), Some(&group()));

    // A successor replaces the record.
    f.kv.delete(&leader_key, None).await.unwrap();
    f.kv.put(&leader_key, &leader_record("trader-b", 1), None)
        .await
        .unwrap();
    settle().await;

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-b").unwrap());
}

#[tokio::test(start_paused = true)]
async fn suppression_expires_with_the_cache_ttl() {
    let f = fixture();
    f.kv.put(
        &keys::leader(&service(), &group()),
        &leader_record("trader-a", 0),
        None,
    )
    .await
    .unwrap();
    settle().await;

    f.discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    f.discovery.invalidate(&service(), Some(&group()));

    let result = f.discovery.find_active(&service(), Some(&group())).await;
    assert!(matches!(
        result,
        Err(DiscoveryError::NoActiveInstance { .. })
    ));

    // After one cache TTL the instance becomes eligible again even though
    // the record never moved.
    tokio::time::sleep(CACHE_TTL + Duration::from_millis(100)).await;
    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());
}

// ============================================================================
// Registry-scan path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn scan_returns_the_single_active_instance() {
    let f = fixture();
    f.registry
        .register(&instance("trader-a", InstanceStatus::Active, None))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-b", InstanceStatus::Standby, None))
        .await
        .unwrap();

    let found = f.discovery.find_active(&service(), None).await.unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());
}

#[tokio::test(start_paused = true)]
async fn scan_without_actives_is_not_found() {
    let f = fixture();
    f.registry
        .register(&instance("trader-a", InstanceStatus::Standby, None))
        .await
        .unwrap();

    let result = f.discovery.find_active(&service(), None).await;
    assert!(matches!(
        result,
        Err(DiscoveryError::NoActiveInstance { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn double_active_handoff_prefers_the_higher_term() {
    let f = fixture();
    // Handoff window: the outgoing and incoming leaders both still report
    // ACTIVE in the registry. The incoming one holds the newer record.
    f.registry
        .register(&instance("trader-a", InstanceStatus::Active, Some("default")))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-b", InstanceStatus::Active, Some("blue")))
        .await
        .unwrap();

    f.kv.put(
        &keys::leader(&service(), &GroupName::new("default").unwrap()),
        &leader_record("trader-a", 1),
        None,
    )
    .await
    .unwrap();
    let newer = LeaderRecord::new(
        "trader.blue",
        InstanceId::new("trader-b").unwrap(),
        Term::new(2),
        Utc::now(),
    );
    f.kv.put(
        &keys::leader(&service(), &GroupName::new("blue").unwrap()),
        &newer,
        None,
    )
    .await
    .unwrap();

    let found = f.discovery.find_active(&service(), None).await.unwrap();
    assert_eq!(found, InstanceId::new("trader-b").unwrap());
}

#[tokio::test(start_paused = true)]
async fn double_active_with_equal_terms_prefers_the_lowest_id() {
    let f = fixture();
    f.registry
        .register(&instance("trader-b", InstanceStatus::Active, None))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-a", InstanceStatus::Active, None))
        .await
        .unwrap();

    let found = f.discovery.find_active(&service(), None).await.unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());
}

// ============================================================================
// Healthy listing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn list_healthy_excludes_unroutable_statuses() {
    let f = fixture();
    f.registry
        .register(&instance("trader-a", InstanceStatus::Active, None))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-b", InstanceStatus::Standby, None))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-c", InstanceStatus::Unhealthy, None))
        .await
        .unwrap();
    f.registry
        .register(&instance("trader-d", InstanceStatus::Shutdown, None))
        .await
        .unwrap();

    let healthy = f.discovery.list_healthy(&service()).await.unwrap();
    let ids: Vec<&str> = healthy.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["trader-a", "trader-b"]);
}

#[tokio::test(start_paused = true)]
async fn expired_instances_drop_out_of_healthy_listing() {
    let f = fixture();
    f.registry
        .register(&instance("trader-a", InstanceStatus::Active, None))
        .await
        .unwrap();

    // Registered with a 3 s TTL and never heartbeated.
    tokio::time::sleep(Duration::from_millis(3_200)).await;

    let healthy = f.discovery.list_healthy(&service()).await.unwrap();
    assert!(healthy.is_empty());
}

// ============================================================================
// Watch-driven invalidation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn leadership_change_drops_the_cached_resolution() {
    let f = fixture();
    let leader_key = keys::leader(&service(), &group());
    f.kv.put(&leader_key, &leader_record("trader-a", 0), None)
        .await
        .unwrap();

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-a").unwrap());

    // New leader takes over; the watch drops the cached entry eagerly,
    // well before its TTL.
    f.kv.put(&leader_key, &leader_record("trader-b", 1), None)
        .await
        .unwrap();
    settle().await;

    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-b").unwrap());
}

#[tokio::test(start_paused = true)]
async fn reconnect_flushes_the_whole_cache() {
    let f = fixture();
    let leader_key = keys::leader(&service(), &group());
    f.kv.put(&leader_key, &leader_record("trader-a", 0), None)
        .await
        .unwrap();

    f.discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();

    // Partition: the watch feed dies. While we are blind, leadership moves.
    f.bus.set_connected(false);
    settle().await;
    f.bus.set_connected(true);
    f.kv.put(&leader_key, &leader_record("trader-b", 1), None)
        .await
        .unwrap();

    // The watch re-establishes (with backoff) and flushes the cache, so
    // the next lookup sees the new leader even though the old cache entry
    // was still within its TTL.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let found = f
        .discovery
        .find_active(&service(), Some(&group()))
        .await
        .unwrap();
    assert_eq!(found, InstanceId::new("trader-b").unwrap());
}
