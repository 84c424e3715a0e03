//! STUN client (RFC 5389 Binding only)
//!
//! Discovers the public IPv4 mapping of a UDP socket and classifies the NAT
//! from two independent mappings. IPv6 mappings are rejected.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Magic cookie present in every RFC 5389 message
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;
const HEADER_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum StunError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid STUN response: {0}")]
    InvalidResponse(&'static str),

    #[error("Transaction id mismatch")]
    TransactionMismatch,

    #[error("IPv6 mapping not supported")]
    Ipv6Unsupported,

    #[error("No mapped address in response")]
    NoMappedAddress,

    #[error("Could not resolve STUN server {0}")]
    Resolve(String),

    #[error("No reachability info: all STUN servers failed")]
    NoReachability,
}

pub type Result<T> = std::result::Result<T, StunError>;

/// Result of a successful discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMapping {
    pub public_addr: SocketAddrV4,
    pub local_port: u16,
    pub server: String,
}

/// NAT classification from two mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatType {
    /// Same public port seen from both sockets (or no NAT)
    FullCone,
    /// Same public IP, different ports
    PortRestricted,
    /// Different public IPs; direct connections unlikely
    Symmetric,
    /// Discovery failed
    Unknown,
}

impl NatType {
    /// Classify from the public mappings of two independent sockets
    pub fn classify(first: SocketAddrV4, second: SocketAddrV4) -> Self {
        if first.ip() != second.ip() {
            NatType::Symmetric
        } else if first.port() == second.port() {
            NatType::FullCone
        } else {
            NatType::PortRestricted
        }
    }

    /// Whether peers can be expected to reach us directly
    pub fn is_directly_reachable(&self) -> bool {
        matches!(self, NatType::FullCone | NatType::PortRestricted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::FullCone => "FULL_CONE",
            NatType::PortRestricted => "PORT_RESTRICTED",
            NatType::Symmetric => "SYMMETRIC",
            NatType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a 20-byte Binding Request
pub fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

/// Parse a Binding Response for `transaction_id`.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddrV4> {
    if data.len() < HEADER_LEN {
        return Err(StunError::InvalidResponse("short header"));
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::InvalidResponse("not a binding success response"));
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::InvalidResponse("bad magic cookie"));
    }
    if &data[8..20] != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let end = (HEADER_LEN + msg_len).min(data.len());
    let mut pos = HEADER_LEN;
    let mut mapped = None;
    let mut xor_mapped = None;

    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            return Err(StunError::InvalidResponse("attribute overruns message"));
        }
        let value = &data[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = Some(parse_address(value, true)?),
            ATTR_MAPPED_ADDRESS => mapped = Some(parse_address(value, false)?),
            _ => {}
        }

        // attributes are padded to 4 bytes
        pos = value_start + ((attr_len + 3) & !3);
    }

    xor_mapped.or(mapped).ok_or(StunError::NoMappedAddress)
}

fn parse_address(value: &[u8], xor: bool) -> Result<SocketAddrV4> {
    if value.len() < 4 {
        return Err(StunError::InvalidResponse("short address attribute"));
    }
    match value[1] {
        FAMILY_IPV4 => {}
        FAMILY_IPV6 => return Err(StunError::Ipv6Unsupported),
        _ => return Err(StunError::InvalidResponse("unknown address family")),
    }
    if value.len() < 8 {
        return Err(StunError::InvalidResponse("short IPv4 address"));
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        ip ^= MAGIC_COOKIE;
    }
    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// Encode an XOR-MAPPED-ADDRESS Binding Response; used by tests and local
/// STUN responders
pub fn build_binding_response(transaction_id: &[u8; 12], mapped: SocketAddrV4) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + 12);
    msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);

    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.push(0);
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    msg.extend_from_slice(&(u32::from(*mapped.ip()) ^ MAGIC_COOKIE).to_be_bytes());
    msg
}

/// STUN client configuration
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Servers tried in order (`host:port`)
    pub servers: Vec<String>,
    /// Per-attempt receive timeout
    pub timeout: Duration,
    /// Attempts per server
    pub attempts: u32,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            timeout: Duration::from_secs(3),
            attempts: 2,
        }
    }
}

/// STUN client
#[derive(Debug, Clone)]
pub struct StunClient {
    config: StunConfig,
}

impl StunClient {
    pub fn new(config: StunConfig) -> Self {
        Self { config }
    }

    pub fn with_servers(servers: Vec<String>) -> Self {
        Self::new(StunConfig {
            servers,
            ..Default::default()
        })
    }

    /// Discover the public mapping of `socket`, or of a fresh ephemeral
    /// socket when none is given.
    ///
    /// Tries each server in order with bounded attempts; returns
    /// [`StunError::NoReachability`] when every server fails.
    pub async fn discover_public_address(&self, socket: Option<&UdpSocket>) -> Result<StunMapping> {
        let owned;
        let socket = match socket {
            Some(s) => s,
            None => {
                owned = UdpSocket::bind("0.0.0.0:0").await?;
                &owned
            }
        };
        let local_port = socket.local_addr()?.port();

        for server in &self.config.servers {
            let server_addr = match resolve_ipv4(server).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!("STUN server {} unresolvable: {}", server, e);
                    continue;
                }
            };

            for attempt in 1..=self.config.attempts {
                match self.query(socket, server_addr).await {
                    Ok(public_addr) => {
                        debug!("STUN {} mapped local port {} to {}", server, local_port, public_addr);
                        return Ok(StunMapping {
                            public_addr,
                            local_port,
                            server: server.clone(),
                        });
                    }
                    Err(e) => {
                        debug!("STUN {} attempt {}/{} failed: {}", server, attempt, self.config.attempts, e);
                    }
                }
            }
        }

        warn!("All STUN servers failed");
        Err(StunError::NoReachability)
    }

    /// Classify the NAT using two independent sockets. Never fails; discovery
    /// errors yield [`NatType::Unknown`].
    pub async fn detect_nat_type(&self) -> NatType {
        let first = self.discover_public_address(None).await;
        let second = self.discover_public_address(None).await;
        match (first, second) {
            (Ok(a), Ok(b)) => NatType::classify(a.public_addr, b.public_addr),
            _ => NatType::Unknown,
        }
    }

    async fn query(&self, socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddrV4> {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        let request = build_binding_request(&transaction_id);
        socket.send_to(&request, server).await?;

        let mut buf = [0u8; 512];
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match recv {
                Ok(r) => r?,
                Err(_) => {
                    return Err(StunError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "STUN response timeout",
                    )))
                }
            };
            if from != server {
                continue;
            }
            match parse_binding_response(&buf[..len], &transaction_id) {
                // stray response to an earlier attempt
                Err(StunError::TransactionMismatch) => continue,
                other => return other,
            }
        }
    }
}

impl Default for StunClient {
    fn default() -> Self {
        Self::new(StunConfig::default())
    }
}

async fn resolve_ipv4(server: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(server)
        .await
        .map_err(|_| StunError::Resolve(server.to_string()))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Resolve(server.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn test_request_layout() {
        let req = build_binding_request(&TXID);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[2..4], &[0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..], &TXID);
    }

    #[test]
    fn test_xor_mapped_unmasking() {
        let mapped = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5000);
        let resp = build_binding_response(&TXID, mapped);
        // port on the wire is masked
        assert_eq!(u16::from_be_bytes([resp[26], resp[27]]), 5000 ^ 0x2112);
        assert_eq!(parse_binding_response(&resp, &TXID).unwrap(), mapped);
    }

    #[test]
    fn test_mapped_address_fallback() {
        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&TXID);
        resp.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.extend_from_slice(&[0, FAMILY_IPV4]);
        resp.extend_from_slice(&7000u16.to_be_bytes());
        resp.extend_from_slice(&[10, 0, 0, 1]);

        let addr = parse_binding_response(&resp, &TXID).unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000));
    }

    #[test]
    fn test_rejects_wrong_transaction() {
        let resp = build_binding_response(&TXID, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let other = [0u8; 12];
        assert!(matches!(
            parse_binding_response(&resp, &other),
            Err(StunError::TransactionMismatch)
        ));
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let mut resp = build_binding_response(&TXID, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        resp[4] = 0;
        assert!(matches!(
            parse_binding_response(&resp, &TXID),
            Err(StunError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_rejects_ipv6() {
        let mut resp = build_binding_response(&TXID, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        resp[25] = FAMILY_IPV6;
        assert!(matches!(
            parse_binding_response(&resp, &TXID),
            Err(StunError::Ipv6Unsupported)
        ));
    }

    #[test]
    fn test_nat_classification() {
        let a = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5000);
        let b = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5001);
        let c = SocketAddrV4::new(Ipv4Addr::new(5, 6, 7, 8), 5001);
        assert_eq!(NatType::classify(a, a), NatType::FullCone);
        assert_eq!(NatType::classify(a, b), NatType::PortRestricted);
        assert_eq!(NatType::classify(a, c), NatType::Symmetric);
    }

    /// Minimal responder that reflects the sender's address
    async fn spawn_responder() -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = server.recv_from(&mut buf).await {
                if len < HEADER_LEN {
                    continue;
                }
                let mut txid = [0u8; 12];
                txid.copy_from_slice(&buf[8..20]);
                let SocketAddr::V4(from_v4) = from else { continue };
                let resp = build_binding_response(&txid, from_v4);
                let _ = server.send_to(&resp, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_discover_against_local_responder() {
        let server = spawn_responder().await;
        let client = StunClient::with_servers(vec![server.to_string()]);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let mapping = client.discover_public_address(Some(&socket)).await.unwrap();
        assert_eq!(mapping.public_addr.port(), local.port());
        assert_eq!(mapping.local_port, local.port());
        assert_eq!(mapping.server, server.to_string());
    }

    #[tokio::test]
    async fn test_skips_dead_server() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        let live = spawn_responder().await;

        let client = StunClient::new(StunConfig {
            servers: vec![dead_addr.to_string(), live.to_string()],
            timeout: Duration::from_millis(100),
            attempts: 1,
        });
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapping = client.discover_public_address(Some(&socket)).await.unwrap();
        assert_eq!(mapping.server, live.to_string());
    }

    #[tokio::test]
    async fn test_all_servers_fail() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = StunClient::new(StunConfig {
            servers: vec![dead.local_addr().unwrap().to_string()],
            timeout: Duration::from_millis(50),
            attempts: 2,
        });
        assert!(matches!(
            client.discover_public_address(None).await,
            Err(StunError::NoReachability)
        ));
        assert_eq!(client.detect_nat_type().await, NatType::Unknown);
    }
}
