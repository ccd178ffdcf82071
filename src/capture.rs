//! Audio capture engine: input device to outgoing VBAN stream
//!
//! A dedicated OS thread owns the cpal input stream. The device callback
//! accumulates raw bytes and, once a full read group is buffered, splits
//! it into fixed-size PCM packets and hands them to the buffered outgoing
//! stream without ever waiting on the network.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::packet::{
    AudioHeader, Body, Codec, Header, Packet, StreamName, MAX_AUDIO_PACKET_SIZE, VBAN_HEADER_SIZE,
};
use crate::player::{cpal_sample_format, find_device, StreamFormat};
use crate::streams::BufferedOutgoingStream;

/// Capture tuning
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device name substring; the default device when `None`
    pub device: Option<String>,
    pub format: StreamFormat,
    /// Frames per emitted packet
    pub framebuffer_size: usize,
    /// Packets per device read group
    pub sample_buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            format: StreamFormat::default(),
            framebuffer_size: 128,
            sample_buffer_size: 3,
        }
    }
}

/// Splits raw capture bytes into uniformly-sized PCM packets
struct Packetizer {
    format: StreamFormat,
    frames_per_packet: usize,
    packets_per_group: usize,
    stream_name: String,
    pending: Vec<u8>,
}

impl Packetizer {
    fn new(config: &CaptureConfig, stream_name: String) -> Self {
        Self {
            format: config.format,
            frames_per_packet: config.framebuffer_size,
            packets_per_group: config.sample_buffer_size,
            stream_name,
            pending: Vec::new(),
        }
    }

    fn packet_bytes(&self) -> usize {
        self.frames_per_packet * self.format.bytes_per_frame()
    }

    fn group_bytes(&self) -> usize {
        self.packet_bytes() * self.packets_per_group
    }

    /// Absorb device bytes; emit packets for every complete group
    fn push(&mut self, data: &[u8]) -> Vec<Packet> {
        self.pending.extend_from_slice(data);

        let group = self.group_bytes();
        let mut packets = Vec::new();
        while self.pending.len() >= group {
            let bytes: Vec<u8> = self.pending.drain(..group).collect();
            for piece in bytes.chunks(self.packet_bytes()) {
                packets.push(self.wrap(piece));
            }
        }
        packets
    }

    fn wrap(&self, payload: &[u8]) -> Packet {
        let header = AudioHeader {
            sample_rate: self.format.sample_rate,
            samples_per_frame: self.frames_per_packet as u16,
            channels: self.format.channels,
            bit_resolution: self.format.bit_resolution,
            codec: Codec::Pcm,
            stream_name: StreamName::new(&self.stream_name),
            frame_count: 0,
        };
        Packet::new(
            Header::Audio(header),
            Body::Pcm(Bytes::copy_from_slice(payload)),
        )
    }
}

/// Captures a local input device into one outgoing VBAN stream
pub struct AudioCapture {
    stream: Arc<BufferedOutgoingStream>,
    config: CaptureConfig,
}

struct ShutdownGuard(Arc<AtomicBool>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn build_input_stream(
    host: &cpal::Host,
    config: &CaptureConfig,
    stream: Arc<BufferedOutgoingStream>,
) -> Result<cpal::Stream> {
    let device = find_device(host, config.device.as_deref(), true)?;
    tracing::info!("input device: {}", device.name().unwrap_or_default());

    let sample_format = cpal_sample_format(config.format.bit_resolution).ok_or_else(|| {
        anyhow!(
            "{:?} is not capturable by the audio backend",
            config.format.bit_resolution
        )
    })?;
    let rate = config.format.sample_rate.hz().ok_or_else(|| {
        anyhow!(
            "unknown sample-rate index {}",
            config.format.sample_rate.index()
        )
    })?;

    let stream_config = cpal::StreamConfig {
        channels: config.format.channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut packetizer = Packetizer::new(config, stream.name().to_owned());
    let input = device
        .build_input_stream_raw(
            &stream_config,
            sample_format,
            move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                for packet in packetizer.push(data.bytes()) {
                    if stream.try_send(packet).is_err() {
                        tracing::debug!("outbound queue rejected a capture packet");
                    }
                }
            },
            move |err| {
                tracing::error!("input stream error: {err}");
            },
            None,
        )
        .context("failed to build input stream")?;
    Ok(input)
}

fn capture_thread(
    config: CaptureConfig,
    stream: Arc<BufferedOutgoingStream>,
    ready: oneshot::Sender<Result<()>>,
    shutdown: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let input = match build_input_stream(&host, &config, stream) {
        Ok(input) => input,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if let Err(err) = input.play() {
        let _ = ready.send(Err(anyhow!(err).context("failed to start input stream")));
        return;
    }
    let _ = ready.send(Ok(()));

    while !shutdown.load(Ordering::Acquire) {
        std::thread::park_timeout(Duration::from_millis(200));
    }
    drop(input);
}

impl AudioCapture {
    pub fn new(stream: Arc<BufferedOutgoingStream>, config: CaptureConfig) -> Self {
        Self { stream, config }
    }

    /// Capture until the surrounding task is cancelled. Device open
    /// failure on startup is fatal.
    pub async fn run(self) -> Result<()> {
        let packet_size =
            VBAN_HEADER_SIZE + self.config.framebuffer_size * self.config.format.bytes_per_frame();
        if packet_size > MAX_AUDIO_PACKET_SIZE {
            tracing::warn!(
                "audio packets of {packet_size} bytes exceed the recommended \
                 {MAX_AUDIO_PACKET_SIZE}; consider fewer frames per packet"
            );
        }

        let (ready, started) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        std::thread::Builder::new().name("vban-capture".into()).spawn({
            let config = self.config.clone();
            let stream = self.stream.clone();
            let shutdown = shutdown.clone();
            move || capture_thread(config, stream, ready, shutdown)
        })?;

        started
            .await
            .map_err(|_| anyhow!("audio capture thread exited during startup"))??;
        tracing::info!(
            "capturing to stream {} ({} frames per packet)",
            self.stream.name(),
            self.config.framebuffer_size
        );

        // the guard stops the capture thread when this future is dropped
        let _guard = ShutdownGuard(shutdown);
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BitResolution, SampleRate};
    use pretty_assertions::assert_eq;

    fn config() -> CaptureConfig {
        CaptureConfig {
            device: None,
            format: StreamFormat {
                sample_rate: SampleRate::Rate48000,
                channels: 1,
                bit_resolution: BitResolution::Int16,
            },
            framebuffer_size: 2,
            sample_buffer_size: 3,
        }
    }

    #[test]
    fn test_packetizer_waits_for_a_full_group() {
        let mut packetizer = Packetizer::new(&config(), "Mac In".into());
        // group = 2 frames * 2 bytes * 3 packets = 12 bytes
        assert!(packetizer.push(&[0u8; 11]).is_empty());
        let packets = packetizer.push(&[0u8; 1]);
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn test_packetizer_splits_group_into_uniform_packets() {
        let mut packetizer = Packetizer::new(&config(), "Mac In".into());
        let data: Vec<u8> = (0..12).collect();
        let packets = packetizer.push(&data);

        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            match &packet.header {
                Header::Audio(header) => {
                    assert_eq!(header.samples_per_frame, 2);
                    assert_eq!(header.channels, 1);
                    assert_eq!(header.codec, Codec::Pcm);
                    assert_eq!(header.stream_name.to_string(), "Mac In");
                }
                other => panic!("expected audio header, got {other:?}"),
            }
            let expected: Vec<u8> = (i as u8 * 4..i as u8 * 4 + 4).collect();
            assert_eq!(packet.body, Body::Pcm(Bytes::from(expected)));
        }
    }

    #[test]
    fn test_packetizer_keeps_partial_remainder() {
        let mut packetizer = Packetizer::new(&config(), "Mac In".into());
        let packets = packetizer.push(&[0u8; 17]); // one group + 5 bytes
        assert_eq!(packets.len(), 3);
        assert_eq!(packetizer.pending.len(), 5);

        // the remainder completes on the next push
        let packets = packetizer.push(&[0u8; 7]);
        assert_eq!(packets.len(), 3);
        assert!(packetizer.pending.is_empty());
    }

    #[test]
    fn test_packets_fit_recommended_datagram_size() {
        let config = CaptureConfig::default();
        let packet_size =
            VBAN_HEADER_SIZE + config.framebuffer_size * config.format.bytes_per_frame();
        assert!(packet_size <= MAX_AUDIO_PACKET_SIZE);
    }
}
