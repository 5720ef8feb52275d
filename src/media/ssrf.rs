//! Outbound URL policy
//!
//! Remote ingestion fetches caller-supplied URLs, so every URL and every
//! address it resolves to is checked before a connection is made. Blocked:
//!
//! - schemes other than `https` (and `http` when explicitly allowed)
//! - localhost names and loopback addresses
//! - cloud metadata endpoints (169.254.169.254, fd00:ec2::254, `*.internal`)
//! - private, link-local, CGNAT, documentation, multicast and reserved ranges
//!
//! Checking the literal URL is not enough on its own: the fetcher resolves
//! the host, runs [`UrlPolicy::check_resolved`] on every address, and pins
//! the connection to a checked address so a second DNS answer cannot point
//! somewhere else.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::{Host, Url};

/// Longest URL accepted for remote ingestion
pub const MAX_URL_LENGTH: usize = 2048;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlPolicyError {
    #[error("invalid URL: {0}")]
    Invalid(String),

    #[error("URL too long: {size} chars (max {max})")]
    TooLong { size: usize, max: usize },

    #[error("scheme not allowed: {0}")]
    Scheme(String),

    #[error("blocked destination: {0}")]
    Blocked(String),
}

/// Which destinations remote ingestion may reach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlPolicy {
    /// Permit plain `http://` URLs
    pub allow_http: bool,

    /// Permit loopback and private-range destinations. Metadata endpoints
    /// stay blocked either way.
    pub allow_private_networks: bool,
}

impl UrlPolicy {
    /// Parse `raw` and check it against the policy.
    pub fn check_url(&self, raw: &str) -> Result<Url, UrlPolicyError> {
        if raw.len() > MAX_URL_LENGTH {
            return Err(UrlPolicyError::TooLong {
                size: raw.len(),
                max: MAX_URL_LENGTH,
            });
        }

        let url = Url::parse(raw).map_err(|e| UrlPolicyError::Invalid(e.to_string()))?;

        match url.scheme() {
            "https" => {}
            "http" if self.allow_http => {}
            other => return Err(UrlPolicyError::Scheme(other.to_string())),
        }

        match url.host() {
            None => return Err(UrlPolicyError::Invalid("URL has no host".to_string())),
            Some(Host::Domain(domain)) => self.check_domain(domain)?,
            Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip))?,
            Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip))?,
        }

        Ok(url)
    }

    /// Check an address a hostname resolved to.
    pub fn check_resolved(&self, host: &str, ip: IpAddr) -> Result<(), UrlPolicyError> {
        self.check_ip(ip).map_err(|_| {
            UrlPolicyError::Blocked(format!("{} resolved to internal address {}", host, ip))
        })
    }

    fn check_domain(&self, domain: &str) -> Result<(), UrlPolicyError> {
        let lower = domain.trim_end_matches('.').to_ascii_lowercase();
        if is_metadata_host(&lower) {
            return Err(UrlPolicyError::Blocked(format!(
                "cloud metadata endpoint: {}",
                domain
            )));
        }
        if !self.allow_private_networks && is_localhost_name(&lower) {
            return Err(UrlPolicyError::Blocked(format!("localhost: {}", domain)));
        }
        Ok(())
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), UrlPolicyError> {
        if is_metadata_ip(&ip) {
            return Err(UrlPolicyError::Blocked(format!("cloud metadata endpoint: {}", ip)));
        }
        if !self.allow_private_networks && is_internal_ip(&ip) {
            return Err(UrlPolicyError::Blocked(format!("internal address: {}", ip)));
        }
        Ok(())
    }
}

fn is_localhost_name(host: &str) -> bool {
    host == "localhost" || host == "localhost.localdomain" || host.ends_with(".localhost")
}

fn is_metadata_host(host: &str) -> bool {
    host == "metadata" || host == "instance-data" || host.ends_with(".internal")
}

fn is_metadata_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => *v4 == Ipv4Addr::new(169, 254, 169, 254),
        IpAddr::V6(v6) => {
            *v6 == Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)
                || v6.to_ipv4_mapped().is_some_and(|v4| is_metadata_ip(&IpAddr::V4(v4)))
        }
    }
}

/// Whether `ip` is loopback, private, or otherwise not publicly routable
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => is_internal_ipv6(v6),
    }
}

fn is_internal_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // documentation ranges
        || (a == 192 && b == 0 && c == 2)
        || (a == 198 && b == 51 && c == 100)
        || (a == 203 && b == 0 && c == 113)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (18..=19).contains(&b))
        || a >= 224
}

fn is_internal_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}
