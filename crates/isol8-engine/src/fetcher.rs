//! Remote Code Fetcher (spec §4.5).
//!
//! Invoked when a request carries `code_url` instead of inline `code`.
//! Validation is fail-closed and ordered: policy enabled, scheme allowed,
//! host allow/deny, DNS-resolved private-range rejection, then (if
//! configured) a required hash. The private-range table is IPv4
//! octet-precise and covers the documented IPv6 ranges.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use isol8_common::{EngineError, EngineResult};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::net::lookup_host;

use crate::config::RemoteCodePolicy;

/// The outcome of a successful fetch: the decoded source, the URL it was
/// actually retrieved from (post-redirect), and its SHA-256 hash.
#[derive(Debug, Clone)]
pub struct FetchedCode {
    pub code: String,
    pub canonical_url: String,
    pub hash: String,
}

/// Per-request overrides accompanying a `codeUrl` request.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub allow_insecure_code_url: bool,
    pub code_hash: Option<&'a str>,
}

pub struct RemoteCodeFetcher {
    client: reqwest::Client,
}

impl RemoteCodeFetcher {
    pub fn new() -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|source| EngineError::Fetch { url: String::new(), source })?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, policy: &RemoteCodePolicy, request: FetchRequest<'_>) -> EngineResult<FetchedCode> {
        if !policy.enabled {
            return Err(EngineError::PolicyDenied("remote code fetching is disabled".to_string()));
        }

        let parsed = reqwest::Url::parse(request.url)
            .map_err(|e| EngineError::PolicyDenied(format!("invalid code URL: {e}")))?;

        let scheme = parsed.scheme();
        if scheme == "http" && !request.allow_insecure_code_url {
            return Err(EngineError::PolicyDenied(
                "insecure http code URL requires allowInsecureCodeUrl".to_string(),
            ));
        }
        if !policy.allowed_schemes.iter().any(|s| s == scheme) {
            return Err(EngineError::PolicyDenied(format!("scheme `{scheme}` is not permitted")));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| EngineError::PolicyDenied("code URL has no host".to_string()))?
            .to_string();

        check_host_lists(&host, &policy.allow_hosts, &policy.deny_hosts)?;
        check_dns_resolved_host(&host, parsed.port_or_known_default().unwrap_or(443)).await?;

        if policy.require_hash && request.code_hash.is_none() {
            return Err(EngineError::PolicyDenied(
                "policy requires codeHash but none was provided".to_string(),
            ));
        }

        let response = self
            .client
            .get(parsed.clone())
            .timeout(policy.timeout())
            .send()
            .await
            .map_err(|source| EngineError::Fetch { url: request.url.to_string(), source })?;

        if let Some(len) = response.content_length() {
            if len as usize > policy.max_bytes {
                return Err(EngineError::PolicyDenied(format!(
                    "Content-Length {len} exceeds max {}",
                    policy.max_bytes
                )));
            }
        }

        let canonical_url = response.url().to_string();
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        {
            use futures::StreamExt;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|source| EngineError::Fetch { url: request.url.to_string(), source })?;
                body.extend_from_slice(&chunk);
                if body.len() > policy.max_bytes {
                    return Err(EngineError::PolicyDenied(format!(
                        "response body exceeded max {} bytes",
                        policy.max_bytes
                    )));
                }
            }
        }

        let code = String::from_utf8(body)
            .map_err(|_| EngineError::PolicyDenied("code body is not valid UTF-8".to_string()))?;
        if code.contains('\0') {
            return Err(EngineError::PolicyDenied("code body contains NUL bytes".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        let hash = hex::encode(hasher.finalize());

        if let Some(expected) = request.code_hash {
            if !expected.eq_ignore_ascii_case(&hash) {
                return Err(EngineError::PolicyDenied("codeHash mismatch".to_string()));
            }
        }

        Ok(FetchedCode { code, canonical_url, hash })
    }
}

fn check_host_lists(host: &str, allow: &[String], deny: &[String]) -> EngineResult<()> {
    for pattern in deny {
        let re = Regex::new(pattern)
            .map_err(|source| EngineError::InvalidFilterPattern { pattern: pattern.clone(), source })?;
        if re.is_match(host) {
            return Err(EngineError::PolicyDenied(format!("host `{host}` matches deny list")));
        }
    }
    if allow.is_empty() {
        return Ok(());
    }
    for pattern in allow {
        let re = Regex::new(pattern)
            .map_err(|source| EngineError::InvalidFilterPattern { pattern: pattern.clone(), source })?;
        if re.is_match(host) {
            return Ok(());
        }
    }
    Err(EngineError::PolicyDenied(format!("host `{host}` does not match allow list")))
}

/// Resolves `host` via DNS and rejects it if any returned address is in a
/// private, loopback, link-local, unique-local, or carrier-grade-NAT range
/// (spec §4.5 private-range table).
async fn check_dns_resolved_host(host: &str, port: u16) -> EngineResult<()> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| EngineError::PolicyDenied(format!("DNS resolution failed for `{host}`: {e}")))?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        if is_blocked_address(addr) {
            return Err(EngineError::PolicyDenied(format!(
                "Blocked code URL host: `{host}` resolves to {}",
                addr.ip()
            )));
        }
    }
    if !saw_any {
        return Err(EngineError::PolicyDenied(format!("DNS resolution for `{host}` returned no addresses")));
    }
    Ok(())
}

fn is_blocked_address(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    match octets[0] {
        10 => true,
        127 => true,
        169 if octets[1] == 254 => true,
        172 if (16..=31).contains(&octets[1]) => true,
        192 if octets[1] == 168 => true,
        100 if (64..=127).contains(&octets[1]) => true,
        0 => true,
        _ => false,
    }
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::LOCALHOST {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7: top 7 bits are 1111110
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10: link-local
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // IPv4-mapped addresses inherit the IPv4 table.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    false
}

pub fn timeout_for(policy: &RemoteCodePolicy) -> Duration {
    policy.timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_ipv4_private_ranges() {
        assert!(is_blocked_ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_blocked_ipv4(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(is_blocked_ipv4(Ipv4Addr::new(172, 20, 0, 1)));
        assert!(!is_blocked_ipv4(Ipv4Addr::new(172, 15, 0, 1)));
        assert!(is_blocked_ipv4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_blocked_ipv4(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(!is_blocked_ipv4(Ipv4Addr::new(100, 128, 0, 1)));
        assert!(is_blocked_ipv4(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_blocked_ipv4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn blocks_ipv6_loopback_and_unique_local() {
        assert!(is_blocked_ipv6(Ipv6Addr::LOCALHOST));
        assert!(is_blocked_ipv6("fc00::1".parse().unwrap()));
        assert!(is_blocked_ipv6("fe80::1".parse().unwrap()));
        assert!(!is_blocked_ipv6("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn deny_list_takes_precedence_over_allow_list() {
        let allow = vec!["^example\\.com$".to_string()];
        let deny = vec!["^example\\.com$".to_string()];
        let err = check_host_lists("example.com", &allow, &deny).unwrap_err();
        assert!(matches!(err, EngineError::PolicyDenied(_)));
    }

    #[test]
    fn empty_allow_list_permits_after_deny() {
        assert!(check_host_lists("anything.example", &[], &["^blocked\\.example$".to_string()]).is_ok());
    }
}
