//! Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol)):
//! HTTP over UDP multicast at `239.255.255.250:1900`.
//!
//! Two socket roles per interface, both thin façades over one transport:
//! the *search* socket (ephemeral port, multicast TTL 4) sends `M-SEARCH`
//! and receives unicast replies; the *notify* socket (port 1900,
//! `SO_REUSEADDR`, group joined on the interface address) receives multicast
//! advertisements. Accepted datagrams are forwarded into a bounded channel
//! drained by the control point.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::http::{Headers, HttpRequest, HttpResponse};
use crate::interface::Iface;

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_PORT: u16 = 1900;
pub(crate) const SSDP_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, SSDP_PORT));

const SEARCH_TTL: u32 = 4;
const SEARCH_MX: u32 = 1;
const RECV_BUFFER_SIZE: usize = 1500;

/// The wildcard search target.
pub const SEARCH_TARGET_ALL: &str = "ssdp:all";

/// Advertisement lifetime applied when `CACHE-CONTROL` is missing or
/// unparsable, in seconds.
pub const DEFAULT_MAX_AGE: u64 = 1800;

/// Notification subtype of a NOTIFY advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nts {
    /// Device is present, or reaffirming its presence.
    Alive,
    /// Device is leaving the network.
    ByeBye,
    /// Device details changed.
    Update,
}

impl FromStr for Nts {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ssdp:alive" => Ok(Self::Alive),
            "ssdp:byebye" => Ok(Self::ByeBye),
            "ssdp:update" => Ok(Self::Update),
            other => Err(Error::Protocol(format!("unknown NTS {other:?}"))),
        }
    }
}

impl std::fmt::Display for Nts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Nts::Alive => "ssdp:alive",
            Nts::ByeBye => "ssdp:byebye",
            Nts::Update => "ssdp:update",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SsdpKind {
    Notify,
    Search,
    SearchResponse,
}

/// The parsed form of one SSDP datagram.
///
/// Created when the datagram arrives, immutable afterwards. `uuid`/`usn_type`
/// are the two halves of the `USN` header; `max_age` comes out of
/// `CACHE-CONTROL`.
#[derive(Debug, Clone)]
pub struct SsdpMessage {
    iface_addr: Ipv4Addr,
    peer: SocketAddr,
    kind: SsdpKind,
    headers: Headers,
}

impl SsdpMessage {
    pub fn parse(iface_addr: Ipv4Addr, peer: SocketAddr, data: &[u8]) -> Result<Self> {
        if data.starts_with(b"HTTP/") {
            let response = HttpResponse::parse(data)?;
            if response.status != 200 {
                return Err(Error::Protocol(format!(
                    "search response status {}",
                    response.status
                )));
            }
            return Ok(Self {
                iface_addr,
                peer,
                kind: SsdpKind::SearchResponse,
                headers: response.headers,
            });
        }
        let request = HttpRequest::parse(data)?;
        let kind = match request.method.as_str() {
            "NOTIFY" => SsdpKind::Notify,
            "M-SEARCH" => SsdpKind::Search,
            other => {
                return Err(Error::Protocol(format!("unexpected SSDP method {other:?}")))
            }
        };
        Ok(Self {
            iface_addr,
            peer,
            kind,
            headers: request.headers,
        })
    }

    /// Address of the interface the datagram arrived on.
    pub fn iface_addr(&self) -> Ipv4Addr {
        self.iface_addr
    }

    /// Source peer of the datagram.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_search(&self) -> bool {
        self.kind == SsdpKind::Search
    }

    pub fn is_search_response(&self) -> bool {
        self.kind == SsdpKind::SearchResponse
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn nts(&self) -> Option<Nts> {
        self.headers.get("NTS").and_then(|v| v.parse().ok())
    }

    pub fn is_byebye(&self) -> bool {
        self.nts() == Some(Nts::ByeBye)
    }

    pub fn usn(&self) -> Option<&str> {
        self.headers.get("USN")
    }

    /// The `uuid:...` half of the USN.
    pub fn uuid(&self) -> &str {
        let usn = self.usn().unwrap_or("");
        match usn.split_once("::") {
            Some((uuid, _)) => uuid,
            None => usn,
        }
    }

    /// The device/service type half of the USN, when present.
    pub fn usn_type(&self) -> Option<&str> {
        self.usn().and_then(|usn| usn.split_once("::")).map(|(_, t)| t)
    }

    /// `NT` of an advertisement or `ST` of a search response.
    pub fn notification_type(&self) -> Option<&str> {
        self.headers.get("NT").or_else(|| self.headers.get("ST"))
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location")
    }

    /// `max-age` out of `CACHE-CONTROL`, defaulting when missing or
    /// unparsable.
    pub fn max_age(&self) -> u64 {
        self.headers
            .get("Cache-Control")
            .and_then(|v| {
                v.split(',').find_map(|part| {
                    let (key, value) = part.split_once('=')?;
                    if !key.trim().eq_ignore_ascii_case("max-age") {
                        return None;
                    }
                    value.trim().parse().ok()
                })
            })
            .unwrap_or(DEFAULT_MAX_AGE)
    }
}

/// Validity filter applied before a datagram reaches the control point.
/// Returns the rejection reason.
pub(crate) fn validate(
    msg: &SsdpMessage,
    iface: &Iface,
    from_notify_socket: bool,
) -> std::result::Result<(), &'static str> {
    // we are a control point, not a device
    if msg.is_search() {
        return Err("M-SEARCH request");
    }
    if from_notify_socket {
        let SocketAddr::V4(peer) = msg.peer else {
            return Err("non-ipv4 peer");
        };
        // multicast still reaches us from misconfigured hosts that are
        // unreachable unicast; their advertisements are worthless
        if !iface.same_subnet(*peer.ip()) {
            return Err("peer outside interface subnet");
        }
    }
    if msg.is_byebye() {
        return Ok(());
    }
    let Some(location) = msg.location() else {
        return Err("missing LOCATION");
    };
    let Ok(location) = url::Url::parse(location) else {
        return Err("unparsable LOCATION");
    };
    // reject spoofed LOCATION pointing at a different host
    match (location.host(), msg.peer.ip()) {
        (Some(url::Host::Ipv4(host)), std::net::IpAddr::V4(peer)) if host == peer => Ok(()),
        _ => Err("LOCATION host is not the source peer"),
    }
}

pub(crate) fn build_search_request(st: &str, user_agent: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
HOST: {SSDP_IP_ADDR}:{SSDP_PORT}\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: {SEARCH_MX}\r\n\
ST: {st}\r\n\
USER-AGENT: {user_agent}\r\n\
\r\n"
    )
}

#[derive(Debug, Clone, Copy)]
struct SsdpSocketConfig {
    bind_port: u16,
    join_group: bool,
    ttl: u32,
}

/// One UDP socket bound for an interface, with a receive task that parses,
/// filters and forwards datagrams.
#[derive(Debug)]
struct SsdpSocket {
    socket: Arc<UdpSocket>,
    iface: Iface,
    notify_role: bool,
}

impl SsdpSocket {
    fn open(iface: &Iface, config: SsdpSocketConfig) -> Result<Self> {
        let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if config.join_group {
            socket.set_reuse_address(true)?;
            socket.join_multicast_v4(&SSDP_IP_ADDR, &iface.addr)?;
            socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.bind_port)).into())?;
        } else {
            socket.set_multicast_if_v4(&iface.addr)?;
            socket.set_multicast_ttl_v4(config.ttl)?;
            socket.bind(&SocketAddr::V4(SocketAddrV4::new(iface.addr, config.bind_port)).into())?;
        }
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket: Arc::new(socket),
            iface: iface.clone(),
            notify_role: config.join_group,
        })
    }

    fn start(&self, tx: mpsc::Sender<SsdpMessage>, cancel: CancellationToken) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let iface = self.iface.clone();
        let notify_role = self.notify_role;
        tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (read, peer) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                if !cancel.is_cancelled() {
                                    tracing::warn!(iface = %iface.addr, "ssdp receive failed: {e}");
                                }
                                break;
                            }
                        };
                        let msg = match SsdpMessage::parse(iface.addr, peer, &buf[..read]) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::trace!(%peer, "dropping ssdp datagram: {e}");
                                continue;
                            }
                        };
                        if let Err(reason) = validate(&msg, &iface, notify_role) {
                            tracing::trace!(%peer, "dropping ssdp datagram: {reason}");
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::trace!(iface = %iface.addr, "ssdp receive task done");
        })
    }
}

/// Search-side socket: sends `M-SEARCH` to the multicast group, receives
/// unicast replies on an ephemeral port.
#[derive(Debug)]
pub(crate) struct SearchSocket {
    inner: SsdpSocket,
}

impl SearchSocket {
    pub fn open(iface: &Iface) -> Result<Self> {
        let inner = SsdpSocket::open(
            iface,
            SsdpSocketConfig {
                bind_port: 0,
                join_group: false,
                ttl: SEARCH_TTL,
            },
        )?;
        Ok(Self { inner })
    }

    pub fn start(
        &self,
        tx: mpsc::Sender<SsdpMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.inner.start(tx, cancel)
    }

    pub async fn search(&self, st: &str, user_agent: &str) -> Result<()> {
        let request = build_search_request(st, user_agent);
        self.inner
            .socket
            .send_to(request.as_bytes(), SSDP_ADDR)
            .await
            .map_err(Error::transport)?;
        tracing::debug!(iface = %self.inner.iface.addr, %st, "sent M-SEARCH");
        Ok(())
    }
}

/// Notify-side socket: joined to the SSDP group on port 1900, receives
/// multicast advertisements.
#[derive(Debug)]
pub(crate) struct NotifySocket {
    inner: SsdpSocket,
}

impl NotifySocket {
    pub fn open(iface: &Iface) -> Result<Self> {
        let inner = SsdpSocket::open(
            iface,
            SsdpSocketConfig {
                bind_port: SSDP_PORT,
                join_group: true,
                ttl: SEARCH_TTL,
            },
        )?;
        Ok(Self { inner })
    }

    pub fn start(
        &self,
        tx: mpsc::Sender<SsdpMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.inner.start(tx, cancel)
    }
}
