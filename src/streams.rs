//! Stream objects: named logical channels to and from a peer
//!
//! Incoming streams buffer packets behind a back-pressure queue; outgoing
//! streams stamp a strictly increasing framecount into every header and
//! hand the encoded datagram to a sender endpoint. UDP is fire-and-forget
//! here: nothing retries and nothing waits for the network.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::packet::{
    BaudRate, Body, Header, Packet, PacketError, ServiceHeader, ServiceType, StreamName,
    TextHeader, TextStreamType, SERVICE_FUNCTION_REQUEST,
};
use crate::queue::{BackPressureQueue, OverflowPolicy, QueueError};
use crate::transport::{SenderEndpoint, SenderPool};

/// Stream name RT registrations are sent under
pub const RT_STREAM_NAME: &str = "VBAN-RTP";

/// Stream name a Voicemeeter host uses for its RT replies
pub const RT_REPLY_STREAM_NAME: &str = "Voicemeeter-RTP";

/// A named inbound stream fed by the registry
pub struct IncomingStream {
    name: String,
    queue: BackPressureQueue<Packet>,
}

impl IncomingStream {
    pub fn new(name: impl Into<String>, queue_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            name: name.into(),
            queue: BackPressureQueue::new(queue_size, policy),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a packet to the stream's queue under its overflow policy
    pub async fn push(&self, packet: Packet) -> Result<(), QueueError> {
        self.queue.put(packet).await
    }

    /// Wait for the next packet
    pub async fn pop(&self) -> Result<Packet, QueueError> {
        self.queue.get().await
    }

    pub fn try_pop(&self) -> Result<Packet, QueueError> {
        self.queue.try_get()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Close the stream; a consumer blocked in `pop` sees `Closed`
    pub fn close(&self) {
        self.queue.close();
    }
}

/// A named outbound stream over one sender endpoint
pub struct OutgoingStream {
    name: String,
    remote: SocketAddr,
    endpoint: Arc<SenderEndpoint>,
    frame_count: AtomicU32,
}

impl OutgoingStream {
    pub async fn connect(name: &str, remote: SocketAddr, pool: &SenderPool) -> io::Result<Self> {
        Ok(Self {
            name: name.to_owned(),
            remote,
            endpoint: pool.endpoint(remote).await?,
            frame_count: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Framecount of the last packet sent
    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Stamp the next framecount into the header, encode and send.
    ///
    /// Send failures stay on the endpoint; only encoding problems are
    /// reported to the caller.
    pub async fn send(&self, mut packet: Packet) -> Result<(), PacketError> {
        let frame = self.frame_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        packet.header.set_frame_count(frame);
        let data = packet.encode()?;
        self.endpoint.send(&data).await;
        Ok(())
    }
}

/// An outgoing stream with its own queue and forwarder task, for
/// producers that must never wait on the socket (device callbacks)
pub struct BufferedOutgoingStream {
    inner: Arc<OutgoingStream>,
    queue: BackPressureQueue<Packet>,
    forwarder: JoinHandle<()>,
}

impl BufferedOutgoingStream {
    pub async fn connect(
        name: &str,
        remote: SocketAddr,
        pool: &SenderPool,
        queue_size: usize,
        policy: OverflowPolicy,
    ) -> io::Result<Self> {
        let inner = Arc::new(OutgoingStream::connect(name, remote, pool).await?);
        let queue = BackPressureQueue::new(queue_size, policy);

        let forwarder = tokio::spawn({
            let queue = queue.clone();
            let outgoing = inner.clone();
            async move {
                while let Ok(packet) = queue.get().await {
                    if let Err(err) = outgoing.send(packet).await {
                        tracing::debug!(
                            "dropping unencodable packet on {}: {err}",
                            outgoing.name()
                        );
                    }
                }
            }
        });

        Ok(Self {
            inner,
            queue,
            forwarder,
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.frame_count()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn send(&self, packet: Packet) -> Result<(), QueueError> {
        self.queue.put(packet).await
    }

    /// Non-suspending enqueue for synchronous callers
    pub fn try_send(&self, packet: Packet) -> Result<(), QueueError> {
        self.queue.try_put(packet)
    }
}

impl Drop for BufferedOutgoingStream {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// An outgoing stream that frames UTF-8 command text
pub struct TextStream {
    inner: OutgoingStream,
    baud: BaudRate,
}

impl TextStream {
    pub async fn connect(
        name: &str,
        remote: SocketAddr,
        pool: &SenderPool,
        baud: BaudRate,
    ) -> io::Result<Self> {
        Ok(Self {
            inner: OutgoingStream::connect(name, remote, pool).await?,
            baud,
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn send_text(&self, text: &str) -> Result<(), PacketError> {
        let header = Header::Text(TextHeader {
            baud: self.baud,
            channel: 0,
            format_bit: 0,
            stream_type: TextStreamType::Utf8,
            stream_name: StreamName::new(self.inner.name()),
            frame_count: 0,
        });
        self.inner
            .send(Packet::new(header, Body::Text(text.to_owned())))
            .await
    }
}

fn registration_packet(name: &str, update_interval: u8) -> Packet {
    Packet::new(
        Header::Service(ServiceHeader {
            function: SERVICE_FUNCTION_REQUEST,
            service: ServiceType::RtPacketRegister,
            additional_info: update_interval,
            stream_name: StreamName::new(name),
            frame_count: 0,
        }),
        Body::Raw(Bytes::new()),
    )
}

async fn renew_registration(outgoing: Arc<OutgoingStream>, update_interval: u8) {
    let ttl = Duration::from_secs(update_interval as u64);
    loop {
        tokio::time::sleep(ttl).await;
        tracing::debug!("renewing RT registration on {}", outgoing.name());
        if let Err(err) = outgoing
            .send(registration_packet(outgoing.name(), update_interval))
            .await
        {
            tracing::debug!("RT renewal send failed: {err}");
        }
    }
}

/// Subscription to a remote Voicemeeter's real-time state.
///
/// Registration expires after `update_interval` seconds on the remote
/// side; a renewal task re-registers on the same cadence until the
/// stream is closed or dropped. Closing sends no farewell.
pub struct RtStream {
    incoming: IncomingStream,
    outgoing: Arc<OutgoingStream>,
    update_interval: u8,
    renewal: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RtStream {
    pub async fn connect(
        remote: SocketAddr,
        pool: &SenderPool,
        update_interval: u8,
        automatic_renewal: bool,
        queue_size: usize,
        policy: OverflowPolicy,
    ) -> anyhow::Result<Self> {
        let outgoing = Arc::new(OutgoingStream::connect(RT_STREAM_NAME, remote, pool).await?);
        let stream = Self {
            incoming: IncomingStream::new(RT_STREAM_NAME, queue_size, policy),
            outgoing: outgoing.clone(),
            update_interval,
            renewal: parking_lot::Mutex::new(None),
        };

        tracing::info!("registering for RT updates every {update_interval}s");
        outgoing
            .send(registration_packet(RT_STREAM_NAME, update_interval))
            .await?;

        if automatic_renewal && update_interval > 0 {
            let handle = tokio::spawn(renew_registration(outgoing, update_interval));
            *stream.renewal.lock() = Some(handle);
        }
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        self.incoming.name()
    }

    pub fn update_interval(&self) -> u8 {
        self.update_interval
    }

    /// Queue an inbound packet. Only RT service packets are accepted;
    /// anything else is logged and discarded.
    pub async fn push(&self, packet: Packet) -> Result<(), QueueError> {
        match &packet.header {
            Header::Service(service) if service.service == ServiceType::RtPacket => {
                self.incoming.push(packet).await
            }
            other => {
                tracing::debug!(
                    "discarding non-RT packet ({:?}) on {}",
                    other.sub_protocol(),
                    self.incoming.name()
                );
                Ok(())
            }
        }
    }

    pub async fn pop(&self) -> Result<Packet, QueueError> {
        self.incoming.pop().await
    }

    pub fn try_pop(&self) -> Result<Packet, QueueError> {
        self.incoming.try_pop()
    }

    /// Stop renewing the registration; pending timers are cancelled
    pub fn close(&self) {
        if let Some(handle) = self.renewal.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RtStream {
    fn drop(&mut self) {
        self.close();
    }
}
