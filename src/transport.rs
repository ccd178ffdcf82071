//! UDP transport endpoints
//!
//! One listener per local bind hands decoded packets to the peer
//! registry; sender endpoints are connected sockets pooled per remote
//! address. UDP sends are fire-and-forget: failures are recorded on the
//! endpoint and surfaced to whoever awaits its failure signal, never to
//! the sending caller.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::packet::{Packet, MAX_DATAGRAM_SIZE};
use crate::registry::Registry;

/// Receives VBAN datagrams on one local bind
pub struct Listener {
    socket: UdpSocket,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("VBAN listener bound on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until the surrounding task is cancelled or the
    /// socket fails.
    ///
    /// Each accepted datagram is dispatched on its own task; the task set
    /// is dropped (and every in-flight dispatch aborted) when this future
    /// is cancelled.
    pub async fn run(&self, registry: Arc<Registry>) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            while tasks.try_join_next().is_some() {}

            if registry.quick_reject(src.ip()) {
                continue;
            }
            match Packet::decode(&buf[..len]) {
                Ok(packet) => {
                    let registry = registry.clone();
                    tasks.spawn(async move {
                        registry.dispatch(src, packet).await;
                    });
                }
                Err(err) => {
                    tracing::info!("dropping malformed datagram from {src}: {err}");
                }
            }
        }
    }
}

/// A connected UDP socket for one remote address
pub struct SenderEndpoint {
    socket: UdpSocket,
    remote: SocketAddr,
    failure: parking_lot::Mutex<Option<io::Error>>,
    has_failed: AtomicBool,
    notify: Notify,
}

impl SenderEndpoint {
    async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket,
            remote,
            failure: parking_lot::Mutex::new(None),
            has_failed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Fire-and-forget send. The first failure is kept for
    /// [`take_error`](Self::take_error) and wakes
    /// [`until_failure`](Self::until_failure) waiters.
    pub async fn send(&self, data: &[u8]) {
        if let Err(err) = self.socket.send(data).await {
            tracing::debug!("udp send to {} failed: {err}", self.remote);
            {
                let mut slot = self.failure.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
            self.has_failed.store(true, Ordering::Release);
            self.notify.notify_waiters();
        }
    }

    pub fn take_error(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }

    /// Resolves once any send on this endpoint has failed
    pub async fn until_failure(&self) {
        loop {
            if self.has_failed.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if self.has_failed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Sender endpoints keyed by remote address, created on first use
#[derive(Default)]
pub struct SenderPool {
    endpoints: tokio::sync::Mutex<HashMap<SocketAddr, Arc<SenderEndpoint>>>,
}

impl SenderPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn endpoint(&self, remote: SocketAddr) -> io::Result<Arc<SenderEndpoint>> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(&remote) {
            return Ok(endpoint.clone());
        }
        let endpoint = Arc::new(SenderEndpoint::connect(remote).await?);
        endpoints.insert(remote, endpoint.clone());
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn local_receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_endpoint_delivers_datagrams() {
        let (receiver, addr) = local_receiver().await;
        let pool = SenderPool::new();
        let endpoint = pool.endpoint(addr).await.unwrap();

        endpoint.send(b"hello vban").await;

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello vban");
        assert!(endpoint.take_error().is_none());
    }

    #[tokio::test]
    async fn test_listener_feeds_registered_streams() {
        use crate::packet::{
            AudioHeader, BitResolution, Body, Codec, Header, SampleRate, StreamName,
        };
        use crate::queue::OverflowPolicy;
        use crate::registry::{AppInfo, Registry};
        use bytes::Bytes;
        use std::time::Duration;

        let listener = Listener::bind((Ipv4Addr::LOCALHOST, 0).into()).await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let registry = Arc::new(Registry::new(AppInfo::default()));
        let peer = registry.register("127.0.0.1", 6980).unwrap();
        let stream = peer.receive_stream("mic", OverflowPolicy::Block);

        let run_registry = registry.clone();
        let listen_task = tokio::spawn(async move {
            let _ = listener.run(run_registry).await;
        });

        let header = AudioHeader {
            sample_rate: SampleRate::Rate48000,
            samples_per_frame: 2,
            channels: 1,
            bit_resolution: BitResolution::Int16,
            codec: Codec::Pcm,
            stream_name: StreamName::new("mic"),
            frame_count: 5,
        };
        let packet = Packet::new(
            Header::Audio(header),
            Body::Pcm(Bytes::from_static(&[1, 2, 3, 4])),
        );

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        // a malformed datagram first: logged and dropped, never fatal
        sender.send_to(b"not vban at all", listen_addr).await.unwrap();
        sender
            .send_to(&packet.encode().unwrap(), listen_addr)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), stream.pop())
            .await
            .expect("listener should deliver the packet")
            .unwrap();
        assert_eq!(received, packet);

        listen_task.abort();
    }

    #[tokio::test]
    async fn test_pool_reuses_endpoint_per_remote() {
        let (_receiver, addr) = local_receiver().await;
        let (_other_receiver, other_addr) = local_receiver().await;
        let pool = SenderPool::new();

        let first = pool.endpoint(addr).await.unwrap();
        let second = pool.endpoint(addr).await.unwrap();
        let third = pool.endpoint(other_addr).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
