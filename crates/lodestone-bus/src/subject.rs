//! Subject grammar and pattern matching.
//!
//! Subjects are dot-separated token sequences:
//!
//! | Subject | Usage |
//! |---|---|
//! | `rpc.<service>.<instance>.<method>` | instance-addressed RPC (sticky routing) |
//! | `rpc.<service>.<method>` | queue-group routed RPC (any instance) |
//! | `events.<service>.<event>` | service events, broadcast or compete |
//!
//! Patterns use the transport's wildcards: `*` matches exactly one token,
//! `>` matches one or more trailing tokens and must be the last token.

use lodestone_types::{InstanceId, ServiceName};

/// Subject for an instance-addressed RPC call.
pub fn rpc_instance(service: &ServiceName, instance: &InstanceId, method: &str) -> String {
    format!("rpc.{service}.{instance}.{method}")
}

/// Subject for a queue-group routed RPC call.
pub fn rpc_any(service: &ServiceName, method: &str) -> String {
    format!("rpc.{service}.{method}")
}

/// Queue group used by instances competing for `rpc_any` calls.
pub fn rpc_queue_group(service: &ServiceName) -> String {
    format!("rpc-{service}")
}

/// Subject for a service event.
pub fn event(service: &ServiceName, event_name: &str) -> String {
    format!("events.{service}.{event_name}")
}

/// Matches a subject (or KV key) against a pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
/// A literal pattern matches only itself.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) => {
                if p != s {
                    return false;
                }
            }
            (None, None) => return true,
            // `>` requires at least one token; a bare tail mismatch fails.
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn subject_layout() {
        let service = ServiceName::new("trader").unwrap();
        let instance = InstanceId::new("trader-default-1a2b").unwrap();

        assert_eq!(
            rpc_instance(&service, &instance, "submit_order"),
            "rpc.trader.trader-default-1a2b.submit_order"
        );
        assert_eq!(rpc_any(&service, "quote"), "rpc.trader.quote");
        assert_eq!(rpc_queue_group(&service), "rpc-trader");
        assert_eq!(event(&service, "filled"), "events.trader.filled");
    }

    #[test_case("rpc.trader.a.submit", "rpc.trader.a.submit", true ; "literal match")]
    #[test_case("rpc.trader.a.submit", "rpc.trader.a.cancel", false ; "literal mismatch")]
    #[test_case("rpc.trader.*.submit", "rpc.trader.a.submit", true ; "star one token")]
    #[test_case("rpc.trader.*.submit", "rpc.trader.a.b.submit", false ; "star not two tokens")]
    #[test_case("sticky-active.>", "sticky-active.trader.default", true ; "tail wildcard")]
    #[test_case("sticky-active.>", "sticky-active", false ; "tail needs one token")]
    #[test_case("rpc.>", "events.trader.filled", false ; "tail prefix mismatch")]
    #[test_case("*.trader.*", "rpc.trader.a", true ; "two stars")]
    #[test_case("rpc.trader", "rpc.trader.a", false ; "subject longer")]
    #[test_case("rpc.trader.a", "rpc.trader", false ; "pattern longer")]
    fn pattern_matching(pattern: &str, subject: &str, expected: bool) {
        assert_eq!(matches(pattern, subject), expected);
    }
}
