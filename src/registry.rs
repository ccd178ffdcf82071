//! Peer registry and service-packet dispatch
//!
//! Peers are created by explicit registration and addressed by resolved
//! IP; unsolicited traffic never materializes state. The registry is
//! written only by `register` and read-only on the datagram path, so the
//! receive loop takes no write locks.

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::packet::{
    BaudRate, Body, Header, Packet, SampleRate, ServiceHeader, ServiceType, StreamName,
    SERVICE_FUNCTION_REQUEST, SERVICE_FUNCTION_RESPONSE,
};
use crate::queue::OverflowPolicy;
use crate::service::{DeviceType, Features, Ping};
use crate::streams::{
    BufferedOutgoingStream, IncomingStream, OutgoingStream, RtStream, TextStream,
    RT_REPLY_STREAM_NAME, RT_STREAM_NAME,
};
use crate::transport::SenderPool;

/// Reserved stream name for the symmetric identification ping exchange
pub const SERVICE_STREAM_NAME: &str = "VBAN Service";

/// How this endpoint describes itself in ping responses
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub device_type: DeviceType,
    pub features: Features,
    /// Rendered as `a.b.c.d`
    pub version: [u8; 4],
    pub color_rgb: u32,
    pub preferred_rate: Option<SampleRate>,
    pub min_rate: SampleRate,
    pub max_rate: SampleRate,
    pub lang_code: String,
    pub device_name: String,
    pub manufacturer_name: String,
    pub application_name: String,
    pub host_name: String,
    pub user_name: String,
    pub user_comment: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            device_type: DeviceType::RECEPTOR,
            features: Features::AUDIO | Features::TEXT,
            version: [0, 2, 0, 0],
            color_rgb: 0,
            preferred_rate: None,
            min_rate: SampleRate::Rate6000,
            max_rate: SampleRate::Rate705600,
            lang_code: String::new(),
            device_name: "vban-bridge".into(),
            manufacturer_name: String::new(),
            application_name: "vban-bridge".into(),
            host_name: String::new(),
            user_name: String::new(),
            user_comment: String::new(),
        }
    }
}

impl AppInfo {
    /// Populate a ping body addressed to `distant`
    pub fn to_ping(&self, distant: SocketAddr) -> Ping {
        Ping {
            device_type: self.device_type,
            features: self.features,
            feature_extra: 0,
            preferred_rate: self.preferred_rate.and_then(SampleRate::hz).unwrap_or(0),
            min_rate: self.min_rate.hz().unwrap_or(0),
            max_rate: self.max_rate.hz().unwrap_or(0),
            color_rgb: self.color_rgb,
            version: self.version,
            gps_position: String::new(),
            user_position: String::new(),
            lang_code: self.lang_code.clone(),
            reserved: [0; 8],
            reserved_ex: [0; 64],
            distant_ip: distant.ip().to_string(),
            distant_port: distant.port(),
            distant_reserved: 0,
            device_name: self.device_name.clone(),
            manufacturer_name: self.manufacturer_name.clone(),
            application_name: self.application_name.clone(),
            host_name: self.host_name.clone(),
            user_name: self.user_name.clone(),
            user_comment: self.user_comment.clone(),
        }
    }
}

#[derive(Clone)]
enum StreamBinding {
    Incoming(Arc<IncomingStream>),
    Rt(Arc<RtStream>),
    Outgoing(Arc<OutgoingStream>),
    Buffered(Arc<BufferedOutgoingStream>),
    Text(Arc<TextStream>),
}

/// One registered remote endpoint and its named streams
pub struct Peer {
    address: IpAddr,
    port: u16,
    default_queue_size: usize,
    pool: Arc<SenderPool>,
    streams: RwLock<HashMap<String, StreamBinding>>,
    identification: RwLock<Option<Ping>>,
}

impl Peer {
    fn new(address: IpAddr, port: u16, pool: Arc<SenderPool>, default_queue_size: usize) -> Self {
        Self {
            address,
            port,
            default_queue_size,
            pool,
            streams: RwLock::new(HashMap::new()),
            identification: RwLock::new(None),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn remote_addr(&self) -> SocketAddr {
        (self.address, self.port).into()
    }

    /// Latest identification snapshot received from this peer
    pub fn identification(&self) -> Option<Ping> {
        self.identification.read().clone()
    }

    /// Register a named inbound stream
    pub fn receive_stream(&self, name: &str, policy: OverflowPolicy) -> Arc<IncomingStream> {
        let stream = Arc::new(IncomingStream::new(name, self.default_queue_size, policy));
        self.streams
            .write()
            .insert(name.to_owned(), StreamBinding::Incoming(stream.clone()));
        stream
    }

    /// Open a buffered outbound stream to this peer's default port
    pub async fn send_stream(&self, name: &str) -> Result<Arc<BufferedOutgoingStream>> {
        let stream = Arc::new(
            BufferedOutgoingStream::connect(
                name,
                self.remote_addr(),
                &self.pool,
                self.default_queue_size,
                OverflowPolicy::Drop,
            )
            .await?,
        );
        self.streams
            .write()
            .insert(name.to_owned(), StreamBinding::Buffered(stream.clone()));
        Ok(stream)
    }

    /// Open an unbuffered outbound stream to this peer's default port
    pub async fn outgoing_stream(&self, name: &str) -> Result<Arc<OutgoingStream>> {
        let stream =
            Arc::new(OutgoingStream::connect(name, self.remote_addr(), &self.pool).await?);
        self.streams
            .write()
            .insert(name.to_owned(), StreamBinding::Outgoing(stream.clone()));
        Ok(stream)
    }

    /// Open a command text stream to this peer's default port
    pub async fn text_stream(&self, name: &str, baud: BaudRate) -> Result<Arc<TextStream>> {
        let stream =
            Arc::new(TextStream::connect(name, self.remote_addr(), &self.pool, baud).await?);
        self.streams
            .write()
            .insert(name.to_owned(), StreamBinding::Text(stream.clone()));
        Ok(stream)
    }

    /// Subscribe to this peer's RT updates. Replies arrive under the
    /// canonical return name, so the stream is bound under both its own
    /// name and the `"Voicemeeter-RTP"` alias.
    pub async fn rt_stream(
        &self,
        update_interval: u8,
        automatic_renewal: bool,
        policy: OverflowPolicy,
    ) -> Result<Arc<RtStream>> {
        let stream = Arc::new(
            RtStream::connect(
                self.remote_addr(),
                &self.pool,
                update_interval,
                automatic_renewal,
                self.default_queue_size,
                policy,
            )
            .await?,
        );
        let mut streams = self.streams.write();
        streams.insert(RT_STREAM_NAME.to_owned(), StreamBinding::Rt(stream.clone()));
        streams.insert(
            RT_REPLY_STREAM_NAME.to_owned(),
            StreamBinding::Rt(stream.clone()),
        );
        Ok(stream)
    }

    pub(crate) async fn handle_packet(&self, src: SocketAddr, packet: Packet, app: &AppInfo) {
        let name = packet.header.stream_name().to_string();
        let binding = self.streams.read().get(&name).cloned();

        match binding {
            Some(StreamBinding::Incoming(stream)) => {
                if let Err(err) = stream.push(packet).await {
                    tracing::debug!("inbound queue error on {name}: {err}");
                }
            }
            Some(StreamBinding::Rt(stream)) => {
                if let Err(err) = stream.push(packet).await {
                    tracing::debug!("inbound queue error on {name}: {err}");
                }
            }
            _ => {
                if name == SERVICE_STREAM_NAME {
                    if let Header::Service(service) = &packet.header {
                        let service = service.clone();
                        self.handle_service(src, service, packet.body, app).await;
                        return;
                    }
                }
                tracing::debug!("packet for unregistered stream {name} from {src}");
            }
        }
    }

    async fn handle_service(
        &self,
        src: SocketAddr,
        service: ServiceHeader,
        body: Body,
        app: &AppInfo,
    ) {
        match (service.service, service.function) {
            (ServiceType::Identification, SERVICE_FUNCTION_REQUEST) => {
                tracing::info!("ping request from {src}");
                if let Err(err) = self.send_ping_response(src, app).await {
                    tracing::warn!("failed to answer ping from {src}: {err}");
                }
            }
            (ServiceType::Identification, SERVICE_FUNCTION_RESPONSE) => {
                if let Body::Ping(ping) = body {
                    tracing::info!(
                        "peer {src} identified as {:?} {}",
                        ping.application_name,
                        ping.version_string()
                    );
                    *self.identification.write() = Some(*ping);
                }
            }
            _ => {
                tracing::debug!(
                    "unhandled service packet ({:?}) from {src}",
                    service.service
                );
            }
        }
    }

    /// Answer an identification request at the datagram's source address
    async fn send_ping_response(&self, src: SocketAddr, app: &AppInfo) -> Result<()> {
        let response = Packet::new(
            Header::Service(ServiceHeader {
                function: SERVICE_FUNCTION_RESPONSE,
                service: ServiceType::Identification,
                additional_info: 0,
                stream_name: StreamName::new(SERVICE_STREAM_NAME),
                frame_count: 0,
            }),
            Body::Ping(Box::new(app.to_ping(src))),
        );
        let stream = OutgoingStream::connect(SERVICE_STREAM_NAME, src, &self.pool).await?;
        stream.send(response).await?;
        Ok(())
    }
}

/// All registered peers, keyed by resolved IP address
pub struct Registry {
    peers: RwLock<HashMap<IpAddr, Arc<Peer>>>,
    app: AppInfo,
    pool: Arc<SenderPool>,
    default_queue_size: usize,
}

impl Registry {
    pub fn new(app: AppInfo) -> Self {
        Self::with_queue_size(app, 100)
    }

    pub fn with_queue_size(app: AppInfo, default_queue_size: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            app,
            pool: Arc::new(SenderPool::new()),
            default_queue_size,
        }
    }

    pub fn app(&self) -> &AppInfo {
        &self.app
    }

    /// Resolve `host` and return its peer, creating one if needed.
    ///
    /// Idempotent: a second registration returns the existing peer and
    /// leaves its port untouched.
    pub fn register(&self, host: &str, port: u16) -> Result<Arc<Peer>> {
        let address = resolve_host(host).with_context(|| format!("failed to resolve {host}"))?;
        let mut peers = self.peers.write();
        let peer = peers.entry(address).or_insert_with(|| {
            Arc::new(Peer::new(
                address,
                port,
                self.pool.clone(),
                self.default_queue_size,
            ))
        });
        Ok(peer.clone())
    }

    /// Fast path for the receive loop: true when `ip` has no peer
    pub fn quick_reject(&self, ip: IpAddr) -> bool {
        !self.peers.read().contains_key(&ip)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Route a decoded packet to its peer; unknown sources are dropped
    pub async fn dispatch(&self, src: SocketAddr, packet: Packet) {
        let peer = self.peers.read().get(&src.ip()).cloned();
        if let Some(peer) = peer {
            peer.handle_packet(src, packet, &self.app).await;
        }
    }
}

/// Resolve a host name to its first address answer
fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0u16)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow!("no addresses found for {host}"))
}
