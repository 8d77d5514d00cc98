//! SSRF protection: private-range IP detection and host resolution checks.
//!
//! The API and download tools must never reach internal infrastructure,
//! neither on the initial request nor after a redirect. Hostnames are
//! checked against a block-list, then DNS-resolved and every address
//! verified against the private/reserved ranges.

use std::net::IpAddr;

use thiserror::Error;
use url::Url;

/// Hostnames that are always blocked regardless of DNS.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.goog",
];

/// SSRF check errors.
#[derive(Debug, Error)]
pub enum SsrfError {
    /// The hostname itself is on the block-list.
    #[error("blocked domain: {0}")]
    BlockedDomain(String),
    /// The host resolved to a private or reserved address.
    #[error("host {host} resolves to private IP {ip}")]
    PrivateIp {
        host: String,
        ip: IpAddr,
    },
    /// The URL has no host or resolution failed.
    #[error("cannot verify host: {0}")]
    Unresolvable(String),
}

/// Check whether an IP address is in a private/reserved range.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // 127.0.0.0/8
            octets[0] == 127
            // 10.0.0.0/8
            || octets[0] == 10
            // 172.16.0.0/12
            || (octets[0] == 172 && (octets[1] & 0xF0) == 16)
            // 192.168.0.0/16
            || (octets[0] == 192 && octets[1] == 168)
            // 169.254.0.0/16 (link-local, incl. cloud metadata)
            || (octets[0] == 169 && octets[1] == 254)
            // 100.64.0.0/10 (CGN)
            || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
            // 0.0.0.0
            || (octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] == 0)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            // ::1
            v6.is_loopback()
            // fc00::/7
            || (segments[0] & 0xFE00) == 0xFC00
            // fe80::/10
            || (segments[0] & 0xFFC0) == 0xFE80
            // ::ffff:0:0/96 — IPv4-mapped addresses
            || check_v4_mapped(v6)
        }
    }
}

/// Check IPv4-mapped IPv6 addresses (::ffff:x.x.x.x).
fn check_v4_mapped(v6: &std::net::Ipv6Addr) -> bool {
    let segments = v6.segments();
    if segments[0] == 0
        && segments[1] == 0
        && segments[2] == 0
        && segments[3] == 0
        && segments[4] == 0
        && segments[5] == 0xFFFF
    {
        let hi = segments[6];
        let lo = segments[7];
        let a = (hi >> 8) & 0xFF;
        let b = hi & 0xFF;
        let c = (lo >> 8) & 0xFF;
        let d = lo & 0xFF;
        #[allow(clippy::cast_possible_truncation)]
        let v4 = std::net::Ipv4Addr::new(a as u8, b as u8, c as u8, d as u8);
        return is_private_ip(&IpAddr::V4(v4));
    }
    false
}

/// Check a hostname against the static block-list.
pub fn is_blocked_hostname(host: &str) -> bool {
    let lower = host.to_lowercase();
    BLOCKED_HOSTNAMES.iter().any(|b| *b == lower)
        // IP-literal hosts are checked directly without DNS.
        || lower
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| is_private_ip(&ip))
            .unwrap_or(false)
}

/// Verify a URL's host: block-list first, then DNS resolution with every
/// resolved address checked against the private ranges.
///
/// # Errors
///
/// Returns [`SsrfError`] when the host is blocked, private, or unresolvable.
pub async fn check_url(url: &Url) -> Result<(), SsrfError> {
    let host = url
        .host_str()
        .ok_or_else(|| SsrfError::Unresolvable("URL has no host".to_owned()))?;

    if is_blocked_hostname(host) {
        return Err(SsrfError::BlockedDomain(host.to_owned()));
    }

    // IP literals were fully checked above; skip DNS for them.
    if host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
    {
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SsrfError::Unresolvable(format!("DNS resolution failed for {host}: {e}")))?;

    for addr in addrs {
        if is_private_ip(&addr.ip()) {
            return Err(SsrfError::PrivateIp {
                host: host.to_owned(),
                ip: addr.ip(),
            });
        }
    }

    Ok(())
}
