//! Unit tests for lodestone-types

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use test_case::test_case;

use crate::{
    ErrorCode, ErrorEnvelope, GroupName, InstanceId, InstanceStatus, LeaderRecord, RpcReply,
    RpcRequest, ServiceDefinition, ServiceInstance, ServiceName, Term,
};

// ============================================================================
// Name validation
// ============================================================================

#[test_case("order-gateway" ; "plain name")]
#[test_case("market_data" ; "underscore")]
#[test_case("ctp2" ; "digits")]
fn valid_names_accepted(name: &str) {
    assert!(ServiceName::new(name).is_ok());
    assert!(InstanceId::new(name).is_ok());
    assert!(GroupName::new(name).is_ok());
}

#[test_case("" ; "empty")]
#[test_case("a.b" ; "dot")]
#[test_case("a b" ; "space")]
#[test_case("a*" ; "star")]
#[test_case(">" ; "tail wildcard")]
fn reserved_names_rejected(name: &str) {
    assert!(ServiceName::new(name).is_err());
    assert!(InstanceId::new(name).is_err());
    assert!(GroupName::new(name).is_err());
}

#[test]
fn generated_instance_ids_share_prefix_and_differ() {
    let a = InstanceId::generate("trader-default").unwrap();
    let b = InstanceId::generate("trader-default").unwrap();

    assert!(a.as_str().starts_with("trader-default-"));
    assert!(b.as_str().starts_with("trader-default-"));
    assert_ne!(a, b);
}

// ============================================================================
// Registry records
// ============================================================================

fn sample_instance() -> ServiceInstance {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
    ServiceInstance::new(
        ServiceName::new("trader").unwrap(),
        InstanceId::new("trader-default-1a2b3c4d").unwrap(),
        "1.4.2",
        now,
    )
    .with_sticky_group(GroupName::new("default").unwrap())
    .with_metadata(BTreeMap::from([(
        "zone".to_string(),
        "cn-shanghai".to_string(),
    )]))
}

#[test]
fn touch_refreshes_status_and_timestamp() {
    let mut instance = sample_instance();
    let later = instance.last_heartbeat + chrono::Duration::seconds(1);

    instance.touch(InstanceStatus::Active, later);

    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.last_heartbeat, later);
}

#[test]
fn touch_never_moves_heartbeat_backwards() {
    let mut instance = sample_instance();
    let before = instance.last_heartbeat;
    let earlier = before - chrono::Duration::seconds(30);

    instance.touch(InstanceStatus::Standby, earlier);

    assert_eq!(instance.last_heartbeat, before);
}

#[test_case(InstanceStatus::Active, true)]
#[test_case(InstanceStatus::Standby, true)]
#[test_case(InstanceStatus::Unhealthy, false)]
#[test_case(InstanceStatus::Shutdown, false)]
fn routability_follows_status(status: InstanceStatus, routable: bool) {
    assert_eq!(status.is_routable(), routable);
}

#[test]
fn status_uses_wire_spelling() {
    let json = serde_json::to_string(&InstanceStatus::Active).unwrap();
    assert_eq!(json, "\"ACTIVE\"");
    let json = serde_json::to_string(&InstanceStatus::Unhealthy).unwrap();
    assert_eq!(json, "\"UNHEALTHY\"");
}

// ============================================================================
// Election records
// ============================================================================

#[test]
fn group_key_is_service_dot_group() {
    let service = ServiceName::new("trader").unwrap();
    let group = GroupName::new("default").unwrap();
    assert_eq!(LeaderRecord::group_key_for(&service, &group), "trader.default");
}

#[test]
fn term_succession_is_strictly_increasing() {
    let term = Term::new(0);
    assert_eq!(term.next(), Term::new(1));
    assert_eq!(term.next().next(), Term::new(2));
    assert!(term.next() > term);
}

// ============================================================================
// RPC envelope
// ============================================================================

#[test]
fn not_active_envelope_carries_discovery_hint() {
    let envelope = ErrorEnvelope::not_active(&InstanceId::new("trader-a").unwrap());

    assert_eq!(envelope.code, ErrorCode::NotActive);
    let details = envelope.details.expect("details present");
    assert_eq!(details["hint"], "retry with discovery");
}

#[test]
fn error_codes_use_wire_spelling() {
    let json = serde_json::to_string(&ErrorCode::NotActive).unwrap();
    assert_eq!(json, "\"NOT_ACTIVE\"");
    let json = serde_json::to_string(&ErrorCode::ValidationFailed).unwrap();
    assert_eq!(json, "\"VALIDATION_FAILED\"");
}

#[test]
fn reply_round_trips_through_result() {
    let ok = RpcReply::ok(serde_json::json!({"filled": 3}));
    assert_eq!(
        ok.into_result().unwrap(),
        serde_json::json!({"filled": 3})
    );

    let err = RpcReply::error(ErrorEnvelope::not_found("no such order"));
    let envelope = err.into_result().unwrap_err();
    assert_eq!(envelope.code, ErrorCode::NotFound);
}

#[test]
fn reply_wire_format_is_status_tagged() {
    let json = serde_json::to_value(RpcReply::ok(serde_json::json!(1))).unwrap();
    assert_eq!(json["status"], "ok");

    let json =
        serde_json::to_value(RpcReply::error(ErrorEnvelope::internal("boom"))).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["code"], "INTERNAL");
}

#[test]
fn requests_get_distinct_correlation_ids() {
    let a = RpcRequest::new("submit", serde_json::json!({}));
    let b = RpcRequest::new("submit", serde_json::json!({}));
    assert_ne!(a.correlation_id, b.correlation_id);
}

// ============================================================================
// Round-trip properties
// ============================================================================

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,15}"
}

fn status_strategy() -> impl Strategy<Value = InstanceStatus> {
    prop_oneof![
        Just(InstanceStatus::Active),
        Just(InstanceStatus::Standby),
        Just(InstanceStatus::Unhealthy),
        Just(InstanceStatus::Shutdown),
    ]
}

proptest! {
    #[test]
    fn service_instance_round_trips(
        service in name_strategy(),
        instance in name_strategy(),
        version in "[0-9]\\.[0-9]\\.[0-9]",
        status in status_strategy(),
        secs in 0i64..=4_000_000_000,
        metadata in proptest::collection::btree_map(name_strategy(), name_strategy(), 0..4),
    ) {
        let now = Utc.timestamp_opt(secs, 0).unwrap();
        let mut original = ServiceInstance::new(
            ServiceName::new(service).unwrap(),
            InstanceId::new(instance).unwrap(),
            version,
            now,
        )
        .with_metadata(metadata);
        original.status = status;

        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: ServiceInstance = serde_json::from_slice(&encoded).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn leader_record_round_trips(
        service in name_strategy(),
        group in name_strategy(),
        holder in name_strategy(),
        term in 0u64..=u64::MAX / 2,
        secs in 0i64..=4_000_000_000,
    ) {
        let now = Utc.timestamp_opt(secs, 0).unwrap();
        let service = ServiceName::new(service).unwrap();
        let group = GroupName::new(group).unwrap();
        let original = LeaderRecord::new(
            LeaderRecord::group_key_for(&service, &group),
            InstanceId::new(holder).unwrap(),
            Term::new(term),
            now,
        );

        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: LeaderRecord = serde_json::from_slice(&encoded).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn service_definition_round_trips(
        name in name_strategy(),
        owner in name_strategy(),
        description in ".{0,40}",
        version in "[0-9]\\.[0-9]",
    ) {
        let original = ServiceDefinition {
            name: ServiceName::new(name).unwrap(),
            owner,
            description,
            version,
        };

        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: ServiceDefinition = serde_json::from_slice(&encoded).unwrap();
        prop_assert_eq!(original, decoded);
    }
}
