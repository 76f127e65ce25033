//! C5 — Discovery.
//!
//! Binds an asynchronously-created provider VM (no id returned synchronously
//! by `CreateVM`) to its owning Instance record. One list call per Instance
//! per reconcile cycle; the caller (the instance controller) is responsible
//! for actually invoking [`crate::provider::VmApi::list_vms`] and passing the
//! result in here — this module is pure and unit-testable in isolation.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::provider::Vm;

/// Total budget from `createdAt` before an undiscovered Instance fails.
pub const DISCOVERY_BUDGET: Duration = Duration::from_secs(15 * 60);

/// The hostname prefix derived from an Instance name, used both when asking
/// the provider to name the VM at create time and when matching it back
/// during discovery.
pub fn vm_name_prefix(instance_name: &str) -> String {
    format!("vpsie-{instance_name}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    /// Exactly one unclaimed candidate matched; this is the Instance's VM.
    Found(Vm),
    /// No unambiguous match yet, and the budget has not been exhausted.
    Pending,
    /// No unambiguous match and the 15-minute budget has elapsed.
    TimedOut,
}

/// Attempt to resolve `instance_name`'s VM among `candidates` (already
/// listed from the provider, ideally datacenter-filtered by the caller).
///
/// Matching order per instance: (a) candidate IP equals `node_ip` if the
/// caller has observed one, (b) candidate hostname starts with this
/// instance's derived name prefix. Candidates in `claimed_vm_ids` (already
/// bound to some other Instance) are never considered.
pub fn discover(
    instance_name: &str,
    datacenter_id: &str,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    node_ip: Option<&str>,
    candidates: &[Vm],
    claimed_vm_ids: &HashSet<u64>,
) -> DiscoveryOutcome {
    let prefix = vm_name_prefix(instance_name);

    let unclaimed = candidates
        .iter()
        .filter(|vm| vm.datacenter_id == datacenter_id)
        .filter(|vm| !claimed_vm_ids.contains(&vm.id));

    let by_ip: Vec<&Vm> = match node_ip {
        Some(ip) => unclaimed.clone().filter(|vm| vm.ip_address.as_deref() == Some(ip)).collect(),
        None => Vec::new(),
    };

    let matched = if by_ip.len() == 1 {
        Some(by_ip[0])
    } else if by_ip.is_empty() {
        let by_hostname: Vec<&Vm> = unclaimed.filter(|vm| vm.hostname.starts_with(&prefix)).collect();
        if by_hostname.len() == 1 { Some(by_hostname[0]) } else { None }
    } else {
        None
    };

    match matched {
        Some(vm) => DiscoveryOutcome::Found(vm.clone()),
        None => {
            let elapsed = (now - created_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= DISCOVERY_BUDGET { DiscoveryOutcome::TimedOut } else { DiscoveryOutcome::Pending }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: u64, hostname: &str, dc: &str, ip: Option<&str>) -> Vm {
        Vm {
            id,
            hostname: hostname.to_string(),
            datacenter_id: dc.to_string(),
            ip_address: ip.map(String::from),
            ipv6_address: None,
            status: "running".to_string(),
        }
    }

    #[test]
    fn matches_by_ip_first() {
        let created = Utc::now();
        let candidates = vec![
            vm(1, "unrelated-host", "dc1", Some("10.0.0.5")),
            vm(2, "vpsie-node-a-something", "dc1", Some("10.0.0.9")),
        ];
        let outcome = discover(
            "node-a",
            "dc1",
            created,
            created,
            Some("10.0.0.5"),
            &candidates,
            &HashSet::new(),
        );
        assert_eq!(outcome, DiscoveryOutcome::Found(candidates[0].clone()));
    }

    #[test]
    fn falls_back_to_hostname_prefix_without_ip() {
        let created = Utc::now();
        let candidates = vec![vm(2, "vpsie-node-a-xyz123", "dc1", None)];
        let outcome = discover("node-a", "dc1", created, created, None, &candidates, &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::Found(candidates[0].clone()));
    }

    #[test]
    fn claimed_candidates_are_excluded() {
        let created = Utc::now();
        let candidates = vec![vm(2, "vpsie-node-a-xyz", "dc1", None)];
        let claimed = HashSet::from([2u64]);
        let outcome = discover("node-a", "dc1", created, created, None, &candidates, &claimed);
        assert_eq!(outcome, DiscoveryOutcome::Pending);
    }

    #[test]
    fn ambiguous_hostname_matches_stay_pending() {
        let created = Utc::now();
        let candidates = vec![vm(2, "vpsie-node-a-1", "dc1", None), vm(3, "vpsie-node-a-2", "dc1", None)];
        let outcome = discover("node-a", "dc1", created, created, None, &candidates, &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::Pending);
    }

    #[test]
    fn no_match_before_budget_is_pending() {
        let created = Utc::now();
        let now = created + chrono::Duration::seconds(60);
        let outcome = discover("node-a", "dc1", created, now, None, &[], &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::Pending);
    }

    #[test]
    fn no_match_past_budget_times_out() {
        let created = Utc::now();
        let now = created + chrono::Duration::seconds(901);
        let outcome = discover("node-a", "dc1", created, now, None, &[], &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::TimedOut);
    }

    #[test]
    fn exactly_at_budget_boundary_is_not_yet_timed_out() {
        let created = Utc::now();
        let now = created + chrono::Duration::seconds(899);
        let outcome = discover("node-a", "dc1", created, now, None, &[], &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::Pending);
    }

    #[test]
    fn datacenter_mismatch_is_ignored() {
        let created = Utc::now();
        let candidates = vec![vm(2, "vpsie-node-a-xyz", "dc-other", None)];
        let now = created + chrono::Duration::seconds(901);
        let outcome = discover("node-a", "dc1", created, now, None, &candidates, &HashSet::new());
        assert_eq!(outcome, DiscoveryOutcome::TimedOut);
    }
}
