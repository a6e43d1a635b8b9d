//! Capability classification.
//!
//! Maps a registration payload to a [`Tier`]. Pure and deterministic; the
//! registry calls it on every (re-)registration.

use hive_proto::{RegisterRequest, Tier};
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::ClassifierConfig;

/// Classifies a worker.
///
/// Precedence, first match wins:
/// 1. declared GPU → GPU
/// 2. services declared and all of them storage services → Storage
/// 3. any services declared → CPU
/// 4. publicly routable address or low coordinator latency → Edge
/// 5. CPU
#[must_use]
pub fn classify(request: &RegisterRequest, config: &ClassifierConfig) -> Tier {
    if request.capabilities.has_gpu() {
        return Tier::Gpu;
    }

    if !request.services.is_empty() {
        let storage_only = request
            .services
            .iter()
            .all(|s| config.is_storage_service(&s.name));
        return if storage_only { Tier::Storage } else { Tier::Cpu };
    }

    let low_latency = request
        .capabilities
        .coordinator_rtt_ms
        .is_some_and(|rtt| rtt < config.edge_latency_threshold_ms);
    if low_latency || is_publicly_routable(&request.address) {
        return Tier::Edge;
    }

    Tier::Cpu
}

/// Role assigned to workers that declare no services.
#[must_use]
pub const fn tier_role(tier: Tier) -> &'static str {
    match tier {
        Tier::Gpu => "inference",
        Tier::Cpu => "compute",
        Tier::Storage => "storage",
        Tier::Edge => "edge-routing",
    }
}

/// Services a worker is assigned: its declared service names, or its tier
/// role when it declares none.
#[must_use]
pub fn assigned_services(request: &RegisterRequest, tier: Tier) -> Vec<String> {
    if request.services.is_empty() {
        vec![tier_role(tier).to_owned()]
    } else {
        request.services.iter().map(|s| s.name.clone()).collect()
    }
}

/// Returns true if the host part of `address` is reachable from the public
/// internet: a global IP literal, or a DNS name that is not obviously local.
#[must_use]
pub fn is_publicly_routable(address: &str) -> bool {
    let parsed = if address.contains("://") {
        Url::parse(address)
    } else {
        Url::parse(&format!("http://{address}"))
    };
    let Some(host) = parsed.ok().and_then(|url| url.host_str().map(str::to_owned)) else {
        return false;
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_global_ip(ip);
    }

    let domain = host.trim_end_matches('.').to_ascii_lowercase();
    domain.contains('.')
        && !domain.ends_with(".local")
        && !domain.ends_with(".internal")
        && !domain.ends_with(".lan")
        && !domain.ends_with(".localhost")
}

fn is_global_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_global_v4(v4),
            None => is_global_v6(v6),
        },
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10 is carrier-grade NAT space.
    let shared = a == 100 && (b & 0xc0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || shared)
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
