//! DNS SRV lookup of the discovery backend.
//!
//! One SRV question, class IN, recursion not desired, sent over UDP.
//! Message encoding and decoding is done by `hickory-proto`; this module
//! owns the exchange (timeout, id check, RCODE check) and the mapping of
//! answers to `host:port` strings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::DnsError;
use crate::net::prefer_ipv4;

/// Default time to wait for a UDP response.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest UDP payload accepted.
const MAX_UDP_PAYLOAD: usize = 4096;

/// Longest label allowed by RFC 1035.
const MAX_LABEL_LEN: usize = 63;

/// A decoded SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Position of this record in the answer section, counting every
    /// answer regardless of type.
    pub index: usize,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host name without the trailing root dot.
    pub target: String,
}

/// A record from the additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdditionalRecord {
    /// An IPv4 address record.
    A { name: String, addr: Ipv4Addr },
    /// Any other record type; kept so indices line up with the wire order.
    Other { name: String, rtype: u16 },
}

/// The parts of a DNS response the resolver cares about.
#[derive(Debug, Clone, Default)]
pub struct SrvResponse {
    pub id: u16,
    pub rcode: u16,
    pub truncated: bool,
    pub answers: Vec<SrvRecord>,
    pub additional: Vec<AdditionalRecord>,
}

impl SrvResponse {
    fn from_message(message: &Message) -> Self {
        let answers = message
            .answers()
            .iter()
            .enumerate()
            .filter_map(|(index, record)| match record.data() {
                Some(RData::SRV(srv)) => Some(SrvRecord {
                    index,
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: without_root(srv.target()),
                }),
                _ => {
                    debug!(
                        rtype = %record.record_type(),
                        name = %record.name(),
                        "Skipping non-SRV answer"
                    );
                    None
                }
            })
            .collect();

        let additional = message
            .additionals()
            .iter()
            .map(|record| match record.data() {
                Some(RData::A(a)) => AdditionalRecord::A {
                    name: without_root(record.name()),
                    addr: a.0,
                },
                _ => AdditionalRecord::Other {
                    name: without_root(record.name()),
                    rtype: u16::from(record.record_type()),
                },
            })
            .collect();

        Self {
            id: message.id(),
            rcode: u16::from(message.response_code()),
            truncated: message.truncated(),
            answers,
            additional,
        }
    }

    /// Render every SRV answer as `host:port`, in answer order.
    ///
    /// The host is taken from the additional record whose index matches the
    /// answer's position in the answer section when that record is an A
    /// record, otherwise from the SRV target.
    pub fn host_ports(&self) -> Vec<String> {
        self.answers
            .iter()
            .map(|srv| {
                let host = match self.additional.get(srv.index) {
                    Some(AdditionalRecord::A { addr, .. }) => addr.to_string(),
                    _ => srv.target.clone(),
                };
                join_host_port(&host, srv.port)
            })
            .collect()
    }
}

fn without_root(name: &Name) -> String {
    name.to_utf8().trim_end_matches('.').to_string()
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn parse_name(name: &str) -> Result<Name, DnsError> {
    let invalid = || DnsError::InvalidName(name.to_string());

    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty()
        || trimmed
            .split('.')
            .any(|label| label.is_empty() || label.len() > MAX_LABEL_LEN)
    {
        return Err(invalid());
    }

    let mut parsed = Name::from_ascii(trimmed).map_err(|_| invalid())?;
    parsed.set_fqdn(true);
    Ok(parsed)
}

/// Encode a single-question SRV query with recursion disabled.
pub fn encode_srv_query(id: u16, name: &str) -> Result<Vec<u8>, DnsError> {
    let name = parse_name(name)?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name, RecordType::SRV));

    Ok(message.to_vec()?)
}

/// Decode a DNS response carrying SRV answers.
pub fn decode_srv_response(buf: &[u8]) -> Result<SrvResponse, DnsError> {
    let message = Message::from_vec(buf)?;
    if message.message_type() != MessageType::Response {
        return Err(DnsError::Malformed("not a response"));
    }
    Ok(SrvResponse::from_message(&message))
}

/// Query `server:port` for the SRV records of `name`.
///
/// Returns every answer as `host:port`. An empty answer section is not an
/// error; transport failures, timeouts and non-zero RCODEs are.
pub async fn lookup_srv(
    server: &str,
    port: &str,
    name: &str,
    timeout: Duration,
) -> Result<Vec<String>, DnsError> {
    let server_addr = resolve_server(server, port).await?;
    let id: u16 = rand::random();
    let query = encode_srv_query(id, name)?;

    let bind_addr: SocketAddr = match server_addr {
        SocketAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
        SocketAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server_addr).await?;
    socket.send(&query).await?;

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let n = match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(DnsError::Timeout {
                server: server_addr.to_string(),
            })
        }
    };

    let response = decode_srv_response(&buf[..n])?;
    if response.id != id {
        return Err(DnsError::IdMismatch {
            sent: id,
            received: response.id,
        });
    }
    if response.rcode != u16::from(ResponseCode::NoError) {
        return Err(DnsError::ResponseCode(response.rcode));
    }
    if response.truncated {
        debug!(name = %name, "SRV response truncated, using partial answers");
    }

    let results = response.host_ports();
    debug!(name = %name, server = %server_addr, answers = ?results, "SRV lookup complete");
    Ok(results)
}

async fn resolve_server(server: &str, port: &str) -> Result<SocketAddr, DnsError> {
    let target = format!("{server}:{port}");
    let unresolvable = |detail: String| DnsError::ServerUnresolvable {
        server: target.clone(),
        detail,
    };

    let port_num: u16 = port
        .parse()
        .map_err(|_| unresolvable(format!("invalid port '{port}'")))?;

    let addrs = tokio::net::lookup_host((server, port_num))
        .await
        .map_err(|e| unresolvable(e.to_string()))?;
    prefer_ipv4(addrs).ok_or_else(|| unresolvable("no addresses".to_string()))
}
