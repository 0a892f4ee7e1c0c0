use std::net::{IpAddr, SocketAddr};

use http::header::USER_AGENT;
use http::HeaderMap;
use ipnet::IpNet;

/// Key shared by every request whose address cannot be classified.
pub const SENTINEL_KEY: &str = "0.0.0.0/0";

/// The parts of an incoming request that classification looks at.
#[derive(Debug, Clone, Copy)]
pub struct ClientRequest<'a> {
    /// Transport-level peer address, `ip:port`.
    pub remote_addr: &'a str,
    pub headers: &'a HeaderMap,
}

impl<'a> ClientRequest<'a> {
    pub fn new(remote_addr: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            remote_addr,
            headers,
        }
    }
}

/// Which peers may supply the client address, and where they put it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyTrust {
    networks: Vec<IpNet>,
    headers: Vec<String>,
}

impl ProxyTrust {
    pub fn new(networks: Vec<IpNet>, headers: Vec<String>) -> Self {
        Self { networks, headers }
    }

    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&addr))
    }

    /// The client address a trusted proxy forwarded, if any.
    ///
    /// Headers are tried in configured order. Comma-separated hop lists are
    /// read from the nearest hop outwards and hops that are themselves trusted
    /// proxies are skipped; when every hop is trusted the leftmost one wins.
    fn forwarded_client<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        for name in &self.headers {
            let hops: Vec<&str> = headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .collect();

            let Some(first) = hops.first().copied() else {
                continue;
            };
            let client = hops
                .iter()
                .rev()
                .copied()
                .find(|hop| parse_ip(hop).map_or(true, |ip| !self.is_trusted(ip)))
                .unwrap_or(first);
            return Some(client);
        }
        None
    }
}

/// Classification strategy of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classifier {
    /// Client address truncated to `netmask` bits.
    Subnet { netmask: u8 },
    /// Raw `User-Agent` header value.
    UserAgent,
}

impl Classifier {
    /// Derive the classification key for `request`.
    ///
    /// Never fails: unclassifiable addresses pool under [`SENTINEL_KEY`].
    pub fn classify(&self, request: &ClientRequest<'_>, trust: &ProxyTrust) -> String {
        match *self {
            Classifier::Subnet { netmask } => subnet_key(request, trust, netmask),
            Classifier::UserAgent => request
                .headers
                .get(USER_AGENT)
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .unwrap_or_default(),
        }
    }

    /// Short description for listings, e.g. `subnet/24`.
    pub fn describe(&self) -> String {
        match self {
            Classifier::Subnet { netmask } => format!("subnet/{}", netmask),
            Classifier::UserAgent => "user_agent".to_string(),
        }
    }
}

fn subnet_key(request: &ClientRequest<'_>, trust: &ProxyTrust, netmask: u8) -> String {
    let client = match peer_ip(request.remote_addr) {
        Some(peer) if trust.is_trusted(peer) => match trust.forwarded_client(request.headers) {
            Some(forwarded) => parse_ip(forwarded),
            None => Some(peer),
        },
        // Forwarded headers from untrusted peers are ignored.
        other => other,
    };

    client
        .and_then(|ip| IpNet::new(ip, netmask).ok())
        .map(|net| net.trunc().to_string())
        .unwrap_or_else(|| SENTINEL_KEY.to_string())
}

fn peer_ip(remote_addr: &str) -> Option<IpAddr> {
    remote_addr
        .parse::<SocketAddr>()
        .ok()
        .map(|addr| addr.ip().to_canonical())
}

/// Parse a forwarded hop: a bare address or `ip:port`.
fn parse_ip(hop: &str) -> Option<IpAddr> {
    hop.parse::<IpAddr>()
        .or_else(|_| hop.parse::<SocketAddr>().map(|addr| addr.ip()))
        .ok()
        .map(|ip| ip.to_canonical())
}
