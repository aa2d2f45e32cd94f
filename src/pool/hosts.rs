//! Per-host role cache and target-session-attributes selection.
//!
//! Roles are shared process-wide across pools: two pools pointing at the same
//! host benefit from each other's probes. Entries are copied out under a
//! short lock; probing happens on a rented connector, never under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::{HostSpec, Options, TargetSessionAttrs};

/// Cached role of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Unknown,
    Primary,
    Standby,
    Offline,
}

#[derive(Debug, Clone, Copy)]
struct HostEntry {
    role: HostRole,
    checked_at: quanta::Instant,
}

static HOST_ROLES: Lazy<Mutex<HashMap<(String, u16), HostEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Current cached role, demoted to `Unknown` once older than the recheck
/// window. `ttl` of `None` means entries never go stale.
pub fn cached_role(host: &HostSpec, ttl: Option<Duration>) -> HostRole {
    let guard = HOST_ROLES.lock();
    let Some(entry) = guard.get(&(host.host.clone(), host.port)).copied() else {
        return HostRole::Unknown;
    };
    drop(guard);
    match ttl {
        Some(ttl) if entry.checked_at.elapsed() >= ttl => HostRole::Unknown,
        _ => entry.role,
    }
}

pub fn record_role(host: &HostSpec, role: HostRole) {
    let mut guard = HOST_ROLES.lock();
    guard.insert(
        (host.host.clone(), host.port),
        HostEntry {
            role,
            checked_at: crate::clock::now(),
        },
    );
}

/// Connection refused: keep the host out of rotation for the recheck window.
pub fn mark_offline(host: &HostSpec) {
    record_role(host, HostRole::Offline);
}

#[cfg(test)]
pub fn forget(host: &HostSpec) {
    HOST_ROLES.lock().remove(&(host.host.clone(), host.port));
}

/// Does a host with this role satisfy the selector outright?
pub fn acceptable(attrs: TargetSessionAttrs, role: HostRole) -> bool {
    match attrs {
        TargetSessionAttrs::Any
        | TargetSessionAttrs::PreferPrimary
        | TargetSessionAttrs::PreferStandby => role != HostRole::Offline,
        TargetSessionAttrs::Primary | TargetSessionAttrs::ReadWrite => {
            matches!(role, HostRole::Primary | HostRole::Unknown)
        }
        TargetSessionAttrs::Standby | TargetSessionAttrs::ReadOnly => {
            matches!(role, HostRole::Standby | HostRole::Unknown)
        }
    }
}

/// Is a probed role a hard mismatch for the selector (connection must not be
/// handed out)?
pub fn rejects(attrs: TargetSessionAttrs, read_only: bool) -> bool {
    match attrs {
        TargetSessionAttrs::Primary | TargetSessionAttrs::ReadWrite => read_only,
        TargetSessionAttrs::Standby | TargetSessionAttrs::ReadOnly => !read_only,
        _ => false,
    }
}

/// Whether this selector needs the host role resolved before handing out a
/// connector.
pub fn needs_role(attrs: TargetSessionAttrs) -> bool {
    !matches!(attrs, TargetSessionAttrs::Any)
}

/// Order the configured hosts for a rent attempt: acceptable hosts first
/// (preferred kind leading for the prefer-* selectors), offline hosts last as
/// a final resort, optionally rotated round-robin.
pub fn candidates(
    options: &Options,
    attrs: TargetSessionAttrs,
    round_robin: &AtomicUsize,
) -> Vec<HostSpec> {
    let ttl = options.host_recheck();
    let mut hosts = options.hosts.clone();
    if options.load_balance_hosts && hosts.len() > 1 {
        let offset = round_robin.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(offset);
    }

    let preferred = |role: HostRole| match attrs {
        TargetSessionAttrs::PreferPrimary => role == HostRole::Primary,
        TargetSessionAttrs::PreferStandby => role == HostRole::Standby,
        _ => true,
    };

    let mut first = Vec::new();
    let mut second = Vec::new();
    let mut last = Vec::new();
    for host in hosts {
        let role = cached_role(&host, ttl);
        if role == HostRole::Offline {
            last.push(host);
        } else if !acceptable(attrs, role) {
            // Known wrong kind for a strict selector; keep as fallback in
            // case the cache is wrong and everything else is down.
            last.push(host);
        } else if preferred(role) {
            first.push(host);
        } else {
            second.push(host);
        }
    }
    first.extend(second);
    first.extend(last);
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostSpec {
        HostSpec {
            host: name.to_string(),
            port: 5432,
        }
    }

    fn options(hosts: &str) -> Options {
        Options::parse(&format!("Host={hosts};Username=u")).unwrap()
    }

    #[test]
    fn roles_go_stale_after_ttl() {
        let h = host("stale.example");
        record_role(&h, HostRole::Primary);
        assert_eq!(cached_role(&h, None), HostRole::Primary);
        assert_eq!(
            cached_role(&h, Some(Duration::from_secs(3600))),
            HostRole::Primary
        );
        assert_eq!(cached_role(&h, Some(Duration::ZERO)), HostRole::Unknown);
        forget(&h);
    }

    #[test]
    fn strict_selectors_accept_unknown() {
        assert!(acceptable(TargetSessionAttrs::Primary, HostRole::Unknown));
        assert!(acceptable(TargetSessionAttrs::Primary, HostRole::Primary));
        assert!(!acceptable(TargetSessionAttrs::Primary, HostRole::Standby));
        assert!(!acceptable(TargetSessionAttrs::ReadOnly, HostRole::Primary));
        assert!(!acceptable(TargetSessionAttrs::Any, HostRole::Offline));
    }

    #[test]
    fn probe_rejection_matrix() {
        assert!(rejects(TargetSessionAttrs::ReadWrite, true));
        assert!(!rejects(TargetSessionAttrs::ReadWrite, false));
        assert!(rejects(TargetSessionAttrs::Standby, false));
        assert!(!rejects(TargetSessionAttrs::PreferPrimary, true));
        assert!(!rejects(TargetSessionAttrs::Any, true));
    }

    #[test]
    fn prefer_standby_orders_standbys_first() {
        let opts = options("p1.example,s1.example,p2.example");
        record_role(&host("p1.example"), HostRole::Primary);
        record_role(&host("s1.example"), HostRole::Standby);
        record_role(&host("p2.example"), HostRole::Primary);

        let counter = AtomicUsize::new(0);
        let order = candidates(&opts, TargetSessionAttrs::PreferStandby, &counter);
        assert_eq!(order[0].host, "s1.example");
        assert_eq!(order.len(), 3);

        for name in ["p1.example", "s1.example", "p2.example"] {
            forget(&host(name));
        }
    }

    #[test]
    fn offline_hosts_go_last() {
        let opts = options("down.example,up.example");
        mark_offline(&host("down.example"));
        let counter = AtomicUsize::new(0);
        let order = candidates(&opts, TargetSessionAttrs::Any, &counter);
        assert_eq!(order[0].host, "up.example");
        assert_eq!(order[1].host, "down.example");
        for name in ["down.example", "up.example"] {
            forget(&host(name));
        }
    }

    #[test]
    fn round_robin_rotates_candidates() {
        let opts = Options::parse("Host=a.example,b.example;Username=u;LoadBalanceHosts=true")
            .unwrap();
        let counter = AtomicUsize::new(0);
        let first = candidates(&opts, TargetSessionAttrs::Any, &counter);
        let second = candidates(&opts, TargetSessionAttrs::Any, &counter);
        assert_eq!(first[0].host, "a.example");
        assert_eq!(second[0].host, "b.example");
    }
}
