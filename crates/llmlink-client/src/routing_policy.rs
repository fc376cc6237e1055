//! Platform-aware routing policy
//!
//! Runs in the caller's environment and decides which kinds of connection
//! that environment may attempt at all. A browser on a secure origin cannot
//! address private networks, so a direct connection is never legal there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use url::{Host, Url};

/// Where the calling code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Browser,
    Desktop,
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Browser => write!(f, "browser"),
            ExecutionContext::Desktop => write!(f, "desktop"),
        }
    }
}

impl FromStr for ExecutionContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "browser" | "web" => Ok(ExecutionContext::Browser),
            "desktop" | "native" => Ok(ExecutionContext::Desktop),
            other => Err(format!(
                "unknown execution context '{}', expected 'browser' or 'desktop'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    /// Local-network connection to the LLM runtime
    Direct,
    /// Public tunnel registered by the user's desktop agent
    CloudTunnel,
    None,
}

/// What is currently known to be reachable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionAvailability {
    pub direct: bool,
    pub cloud_tunnel: bool,
}

impl ConnectionAvailability {
    fn is_available(&self, connection_type: ConnectionType) -> bool {
        match connection_type {
            ConnectionType::Direct => self.direct,
            ConnectionType::CloudTunnel => self.cloud_tunnel,
            ConnectionType::None => true,
        }
    }
}

const BROWSER_HIERARCHY: &[ConnectionType] = &[ConnectionType::CloudTunnel];
const DESKTOP_HIERARCHY: &[ConnectionType] = &[ConnectionType::Direct, ConnectionType::CloudTunnel];

/// Pure routing decisions, no I/O
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientRoutingPolicy;

impl ClientRoutingPolicy {
    /// Connection types legal in `context`, most preferred first
    ///
    /// `None` is implied as the last resort.
    pub fn hierarchy(context: ExecutionContext) -> &'static [ConnectionType] {
        match context {
            ExecutionContext::Browser => BROWSER_HIERARCHY,
            ExecutionContext::Desktop => DESKTOP_HIERARCHY,
        }
    }

    /// First legal connection type that is currently available
    pub fn get_best_connection_type(
        context: ExecutionContext,
        availability: &ConnectionAvailability,
    ) -> ConnectionType {
        Self::hierarchy(context)
            .iter()
            .copied()
            .find(|t| availability.is_available(*t))
            .unwrap_or(ConnectionType::None)
    }

    pub fn permits(context: ExecutionContext, connection_type: ConnectionType) -> bool {
        connection_type == ConnectionType::None
            || Self::hierarchy(context).contains(&connection_type)
    }

    /// Whether `context` may send requests to `url` at all
    ///
    /// Desktop callers may reach anything. Browser callers are refused
    /// loopback, private, link-local and `localhost` hosts, as well as URLs
    /// that do not parse.
    pub fn permits_url(context: ExecutionContext, url: &str) -> bool {
        match context {
            ExecutionContext::Desktop => true,
            ExecutionContext::Browser => match Url::parse(url) {
                Ok(parsed) => match parsed.host() {
                    Some(host) => !is_local_host(&host),
                    None => false,
                },
                Err(_) => false,
            },
        }
    }
}

fn is_local_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain
                    .parse::<IpAddr>()
                    .map(|ip| is_local_ip(&ip))
                    .unwrap_or(false)
        }
        Host::Ipv4(ip) => is_local_ip(&IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_local_ip(&IpAddr::V6(*ip)),
    }
}

fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local_ip(&IpAddr::V4(v4));
            }
            v6.is_loopback() || v6.is_unspecified() || is_unique_local(v6) || is_unicast_link_local(v6)
        }
    }
}

// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_AVAILABILITY: [ConnectionAvailability; 4] = [
        ConnectionAvailability {
            direct: false,
            cloud_tunnel: false,
        },
        ConnectionAvailability {
            direct: true,
            cloud_tunnel: false,
        },
        ConnectionAvailability {
            direct: false,
            cloud_tunnel: true,
        },
        ConnectionAvailability {
            direct: true,
            cloud_tunnel: true,
        },
    ];

    #[test]
    fn test_browser_never_direct() {
        for availability in ALL_AVAILABILITY {
            let choice =
                ClientRoutingPolicy::get_best_connection_type(ExecutionContext::Browser, &availability);
            assert_ne!(choice, ConnectionType::Direct);
        }
        assert!(!ClientRoutingPolicy::permits(
            ExecutionContext::Browser,
            ConnectionType::Direct
        ));
    }

    #[test]
    fn test_browser_hierarchy() {
        let choose = |direct, cloud_tunnel| {
            ClientRoutingPolicy::get_best_connection_type(
                ExecutionContext::Browser,
                &ConnectionAvailability {
                    direct,
                    cloud_tunnel,
                },
            )
        };
        assert_eq!(choose(true, true), ConnectionType::CloudTunnel);
        assert_eq!(choose(true, false), ConnectionType::None);
        assert_eq!(choose(false, false), ConnectionType::None);
    }

    #[test]
    fn test_desktop_prefers_direct() {
        let choose = |direct, cloud_tunnel| {
            ClientRoutingPolicy::get_best_connection_type(
                ExecutionContext::Desktop,
                &ConnectionAvailability {
                    direct,
                    cloud_tunnel,
                },
            )
        };
        assert_eq!(choose(true, true), ConnectionType::Direct);
        assert_eq!(choose(false, true), ConnectionType::CloudTunnel);
        assert_eq!(choose(true, false), ConnectionType::Direct);
        assert_eq!(choose(false, false), ConnectionType::None);
    }

    #[test]
    fn test_browser_url_guard() {
        let browser = ExecutionContext::Browser;
        assert!(ClientRoutingPolicy::permits_url(browser, "https://abc.share.example"));
        assert!(ClientRoutingPolicy::permits_url(browser, "https://8.8.8.8/"));

        for url in [
            "http://localhost:11434",
            "http://LOCALHOST:11434",
            "http://ollama.localhost",
            "http://printer.local",
            "http://127.0.0.1:11434",
            "http://10.0.0.5",
            "http://192.168.1.20:11434",
            "http://172.16.0.1",
            "http://169.254.1.1",
            "http://0.0.0.0",
            "http://[::1]:11434",
            "http://[fd00::1]",
            "http://[fe80::1]",
            "http://[::ffff:192.168.1.1]",
            "not a url",
        ] {
            assert!(
                !ClientRoutingPolicy::permits_url(browser, url),
                "{} should be refused",
                url
            );
        }
    }

    #[test]
    fn test_desktop_url_guard_allows_everything() {
        assert!(ClientRoutingPolicy::permits_url(
            ExecutionContext::Desktop,
            "http://localhost:11434"
        ));
        assert!(ClientRoutingPolicy::permits_url(
            ExecutionContext::Desktop,
            "http://192.168.1.20:11434"
        ));
    }

    #[test]
    fn test_execution_context_parse() {
        assert_eq!(
            "browser".parse::<ExecutionContext>(),
            Ok(ExecutionContext::Browser)
        );
        assert_eq!(
            "Desktop".parse::<ExecutionContext>(),
            Ok(ExecutionContext::Desktop)
        );
        assert!("mobile".parse::<ExecutionContext>().is_err());
        assert_eq!(ExecutionContext::Browser.to_string(), "browser");
    }
}
