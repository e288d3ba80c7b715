//! Transport Adapter — UDP/TCP/TLS demultiplexer
//!
//! Binds listening endpoints on v4-any and v6-any (when the host
//! supports dual-stack) and emits parsed requests/responses with their
//! peer endpoints. A parse failure is logged and dropped; a socket
//! error on one channel never affects the others. TCP and TLS share a
//! connection-write registry per channel so a response goes back out
//! on the connection its request arrived on, per RFC 3261 transport
//! rules.

mod parse;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::contact::{self, Destination};
use crate::sip::{SipRequest, SipResponse};
use crate::Result;

pub use parse::parse_request;

#[derive(Debug)]
pub enum TransportEvent {
    Request(SipRequest),
    /// A datagram/segment that failed to parse as a SIP message.
    ParseFailure { peer: SocketAddr },
}

/// Boxed half of a stream connection good for writing a rendered
/// response back out. Erasing `TcpStream`/`TlsStream` behind one type
/// lets TCP and TLS share the same connection-write registry and
/// `write_to` arm.
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type ConnectionWriters = Arc<DashMap<SocketAddr, Arc<Mutex<BoxedWriter>>>>;

/// One bound transport channel (a single protocol on a single socket).
pub enum Channel {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<TcpListener>, ConnectionWriters),
    Tls(Arc<TcpListener>, TlsAcceptor, ConnectionWriters),
}

pub struct TransportAdapter {
    config: TransportConfig,
    private_subnets: Vec<ipnet::IpNet>,
    channels: Vec<Channel>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportAdapter {
    /// Binds UDP and TCP on `sip_listen_port`, and TLS on
    /// `sip_tls_listen_port` when a certificate/key pair is
    /// configured, for both v4-any and v6-any. A missing TLS
    /// certificate disables the TLS channel rather than failing the
    /// whole bind — provisioning one is an external collaborator's job.
    pub async fn bind(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut channels = Vec::new();

        let v4_addr: SocketAddr = format!("0.0.0.0:{}", config.sip_listen_port).parse().unwrap();
        match bind_udp(v4_addr) {
            Ok(socket) => channels.push(Channel::Udp(Arc::new(socket))),
            Err(e) => error!(addr = %v4_addr, error = %e, "failed to bind UDP v4"),
        }

        let v6_addr: SocketAddr = format!("[::]:{}", config.sip_listen_port).parse().unwrap();
        match bind_udp(v6_addr) {
            Ok(socket) => channels.push(Channel::Udp(Arc::new(socket))),
            Err(e) => warn!(addr = %v6_addr, error = %e, "dual-stack UDP v6 unavailable"),
        }

        match TcpListener::bind(v4_addr).await {
            Ok(listener) => channels.push(Channel::Tcp(Arc::new(listener), Arc::new(DashMap::new()))),
            Err(e) => error!(addr = %v4_addr, error = %e, "failed to bind TCP v4"),
        }

        let v6_tcp_addr: SocketAddr = format!("[::]:{}", config.sip_listen_port).parse().unwrap();
        match TcpListener::bind(v6_tcp_addr).await {
            Ok(listener) => channels.push(Channel::Tcp(Arc::new(listener), Arc::new(DashMap::new()))),
            Err(e) => warn!(addr = %v6_tcp_addr, error = %e, "dual-stack TCP v6 unavailable"),
        }

        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert_path), Some(key_path)) => match load_tls_acceptor(cert_path, key_path) {
                Ok(acceptor) => {
                    let tls_v4: SocketAddr = format!("0.0.0.0:{}", config.sip_tls_listen_port)
                        .parse()
                        .unwrap();
                    match TcpListener::bind(tls_v4).await {
                        Ok(listener) => channels.push(Channel::Tls(
                            Arc::new(listener),
                            acceptor.clone(),
                            Arc::new(DashMap::new()),
                        )),
                        Err(e) => error!(addr = %tls_v4, error = %e, "failed to bind TLS v4"),
                    }

                    let tls_v6: SocketAddr = format!("[::]:{}", config.sip_tls_listen_port)
                        .parse()
                        .unwrap();
                    match TcpListener::bind(tls_v6).await {
                        Ok(listener) => channels.push(Channel::Tls(
                            Arc::new(listener),
                            acceptor,
                            Arc::new(DashMap::new()),
                        )),
                        Err(e) => warn!(addr = %tls_v6, error = %e, "dual-stack TLS v6 unavailable"),
                    }
                }
                Err(e) => warn!(error = %e, "TLS transport disabled: failed to load certificate/key"),
            },
            _ => info!("TLS transport disabled: no certificate/key configured"),
        }

        if channels.is_empty() {
            return Err(crate::Error::network("no transport channel could be bound"));
        }

        let private_subnets = config
            .private_subnets
            .iter()
            .filter_map(|s| match s.parse::<ipnet::IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(subnet = %s, error = %e, "ignoring malformed private subnet");
                    None
                }
            })
            .collect();

        Ok((
            Self {
                config,
                private_subnets,
                channels,
                events_tx,
            },
            events_rx,
        ))
    }

    /// Spawns one receive loop per bound channel. Each loop runs until
    /// the adapter is dropped; a single datagram's parse failure never
    /// terminates the loop.
    pub fn spawn_receivers(&self) {
        for channel in &self.channels {
            match channel {
                Channel::Udp(socket) => {
                    let socket = socket.clone();
                    let local_addr = socket.local_addr().ok();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 65536];
                        loop {
                            let (len, peer) = match socket.recv_from(&mut buf).await {
                                Ok(v) => v,
                                Err(e) => {
                                    error!(error = %e, "UDP recv failed");
                                    continue;
                                }
                            };
                            let local = local_addr.unwrap_or(peer);
                            match parse_request(&buf[..len], local, peer) {
                                Some(req) => {
                                    let _ = tx.send(TransportEvent::Request(req));
                                }
                                None => {
                                    debug!(peer = %peer, "dropping unparseable datagram");
                                    let _ = tx.send(TransportEvent::ParseFailure { peer });
                                }
                            }
                        }
                    });
                }
                Channel::Tcp(listener, writers) => {
                    let listener = listener.clone();
                    let writers = writers.clone();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        loop {
                            let (stream, peer) = match listener.accept().await {
                                Ok(v) => v,
                                Err(e) => {
                                    error!(error = %e, "TCP accept failed");
                                    continue;
                                }
                            };
                            let local = stream.local_addr().ok();
                            let writers = writers.clone();
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                handle_stream_connection(stream, peer, local, writers, tx).await;
                            });
                        }
                    });
                }
                Channel::Tls(listener, acceptor, writers) => {
                    let listener = listener.clone();
                    let acceptor = acceptor.clone();
                    let writers = writers.clone();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        loop {
                            let (stream, peer) = match listener.accept().await {
                                Ok(v) => v,
                                Err(e) => {
                                    error!(error = %e, "TLS accept failed");
                                    continue;
                                }
                            };
                            let local = stream.local_addr().ok();
                            let acceptor = acceptor.clone();
                            let writers = writers.clone();
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let stream = match acceptor.accept(stream).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        warn!(peer = %peer, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                };
                                handle_stream_connection(stream, peer, local, writers, tx).await;
                            });
                        }
                    });
                }
            }
        }
        info!(channels = self.channels.len(), "transport receivers running");
    }

    /// Applies the Contact Customiser to INVITE/OPTIONS responses
    /// before handing the bytes to the socket. Non-INVITE/OPTIONS
    /// responses are sent unmodified.
    pub async fn send_response(
        &self,
        mut response: SipResponse,
        cseq_method: crate::sip::SipMethod,
        peer: SocketAddr,
    ) -> Result<()> {
        use crate::sip::SipMethod;
        if matches!(cseq_method, SipMethod::Invite | SipMethod::Options) {
            if let Some(raw) = response.headers.get("Contact").cloned() {
                if let Some(mut uri) = crate::sip::Uri::parse(&raw) {
                    if !self.config_is_private(peer) {
                        let destination = match peer {
                            SocketAddr::V4(_) => Destination::V4(peer.ip()),
                            SocketAddr::V6(_) => Destination::V6(peer.ip()),
                        };
                        contact::rewrite(&mut uri, destination, &self.config);
                        response.headers.insert("Contact".to_string(), uri.to_string());
                    }
                }
            }
        }
        self.write_to(peer, render_response(&response)).await
    }

    fn config_is_private(&self, peer: SocketAddr) -> bool {
        self.private_subnets.iter().any(|net| net.contains(&peer.ip()))
    }

    async fn write_to(&self, peer: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        for channel in &self.channels {
            match channel {
                Channel::Udp(socket) => {
                    if socket.send_to(&bytes, peer).await.is_ok() {
                        return Ok(());
                    }
                }
                Channel::Tcp(_, writers) | Channel::Tls(_, _, writers) => {
                    let writer = writers.get(&peer).map(|entry| entry.value().clone());
                    if let Some(writer) = writer {
                        let mut guard = writer.lock().await;
                        if guard.write_all(&bytes).await.is_ok() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Err(crate::Error::network("no channel accepted the outgoing message"))
    }
}

/// Reads a connection until closed, handing each complete, framed SIP
/// message off as a [`TransportEvent`]. The connection's write half is
/// registered in `writers` for the lifetime of the connection so
/// `send_response` can answer on the same socket the request arrived
/// on, and removed again once the peer disconnects.
async fn handle_stream_connection<S>(
    stream: S,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    writers: ConnectionWriters,
    tx: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let write_half: BoxedWriter = Box::pin(write_half);
    writers.insert(peer, Arc::new(Mutex::new(write_half)));

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %peer, error = %e, "stream read failed");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some((message, consumed)) = extract_message(&buf) {
            let local = local.unwrap_or(peer);
            match parse_request(&message, local, peer) {
                Some(req) => {
                    let _ = tx.send(TransportEvent::Request(req));
                }
                None => {
                    debug!(peer = %peer, "dropping unparseable stream message");
                    let _ = tx.send(TransportEvent::ParseFailure { peer });
                }
            }
            buf.drain(..consumed);
        }
    }

    writers.remove(&peer);
}

/// Extracts one complete SIP message (headers through `Content-Length`
/// bytes of body) from the front of `buf`, if one is fully buffered.
/// Returns the message bytes and how much of `buf` it consumed, so
/// pipelined messages on the same connection are each handled in turn.
fn extract_message(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let header_text = std::str::from_utf8(&buf[..header_end]).ok()?;
    let content_length = header_text
        .split("\r\n")
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    let total = body_start + content_length;
    if buf.len() < total {
        return None;
    }
    Some((buf[..total].to_vec(), total))
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid TLS certificate PEM"))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key_file = std::fs::File::open(key_path)?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut io::BufReader::new(key_file))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid TLS private key PEM"))?;
    if keys.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no PKCS8 private key found",
        ));
    }

    let tls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(keys.remove(0)))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn render_response(response: &SipResponse) -> Vec<u8> {
    let mut out = format!("SIP/2.0 {} {}\r\n", response.status, response.reason);
    out.push_str("Server: signalrtc\r\n");
    for (k, v) in &response.headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(body) = &response.body {
        out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    } else {
        out.push_str("Content-Length: 0\r\n\r\n");
    }
    out.into_bytes()
}
