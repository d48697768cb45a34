//! Key layout of the `service-registry` bucket.
//!
//! | Key | Value | TTL |
//! |---|---|---|
//! | `service-instances.<service>.<instance>` | `ServiceInstance` | heartbeat × k |
//! | `sticky-active.<service>.<group>` | `LeaderRecord` | leader TTL |
//! | `service-definitions.<name>` | `ServiceDefinition` | none |
//!
//! Key segments come from validated name types, so the transport's
//! structural characters (`.`, `*`, `>`) can never appear inside one.

use lodestone_types::{GroupName, InstanceId, ServiceName};

/// Prefix of registry heartbeat entries.
pub const INSTANCES: &str = "service-instances";

/// Prefix of leader records.
pub const STICKY_ACTIVE: &str = "sticky-active";

/// Prefix of management-plane service definitions.
pub const DEFINITIONS: &str = "service-definitions";

/// Registry entry key for one instance.
pub fn instance(service: &ServiceName, instance: &InstanceId) -> String {
    format!("{INSTANCES}.{service}.{instance}")
}

/// Pattern matching every instance of one service.
pub fn instances_of(service: &ServiceName) -> String {
    format!("{INSTANCES}.{service}.*")
}

/// Pattern matching every registry entry.
pub fn all_instances() -> String {
    format!("{INSTANCES}.>")
}

/// Leader record key for a sticky group.
pub fn leader(service: &ServiceName, group: &GroupName) -> String {
    format!("{STICKY_ACTIVE}.{service}.{group}")
}

/// Pattern matching every leader record.
pub fn all_leaders() -> String {
    format!("{STICKY_ACTIVE}.>")
}

/// Definition key for one service.
pub fn definition(name: &ServiceName) -> String {
    format!("{DEFINITIONS}.{name}")
}

/// Pattern matching every service definition.
pub fn all_definitions() -> String {
    format!("{DEFINITIONS}.*")
}

/// Splits a registry entry key back into its names.
pub fn parse_instance_key(key: &str) -> Option<(ServiceName, InstanceId)> {
    let rest = key.strip_prefix(INSTANCES)?.strip_prefix('.')?;
    let (service, instance) = rest.split_once('.')?;
    Some((
        ServiceName::new(service).ok()?,
        InstanceId::new(instance).ok()?,
    ))
}

/// Splits a leader record key back into its names.
pub fn parse_leader_key(key: &str) -> Option<(ServiceName, GroupName)> {
    let rest = key.strip_prefix(STICKY_ACTIVE)?.strip_prefix('.')?;
    let (service, group) = rest.split_once('.')?;
    Some((ServiceName::new(service).ok()?, GroupName::new(group).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> (ServiceName, InstanceId, GroupName) {
        (
            ServiceName::new("trader").unwrap(),
            InstanceId::new("trader-default-1a2b").unwrap(),
            GroupName::new("default").unwrap(),
        )
    }

    #[test]
    fn key_layout_is_stable() {
        let (service, id, group) = names();

        assert_eq!(
            instance(&service, &id),
            "service-instances.trader.trader-default-1a2b"
        );
        assert_eq!(instances_of(&service), "service-instances.trader.*");
        assert_eq!(leader(&service, &group), "sticky-active.trader.default");
        assert_eq!(definition(&service), "service-definitions.trader");
    }

    #[test]
    fn keys_parse_back_into_names() {
        let (service, id, group) = names();

        let (s, i) = parse_instance_key(&instance(&service, &id)).unwrap();
        assert_eq!(s, service);
        assert_eq!(i, id);

        let (s, g) = parse_leader_key(&leader(&service, &group)).unwrap();
        assert_eq!(s, service);
        assert_eq!(g, group);
    }

    #[test]
    fn foreign_keys_do_not_parse() {
        assert!(parse_instance_key("sticky-active.trader.default").is_none());
        assert!(parse_leader_key("sticky-active.trader").is_none());
        assert!(parse_leader_key("service-instances.trader.a").is_none());
    }
}
