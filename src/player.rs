//! Audio playback engine: incoming VBAN stream to output device
//!
//! Two halves share one frame ring. A cooperative network producer pulls
//! packets off the incoming stream, reopens the device when the stream's
//! format changes, and writes trimmed PCM into the ring. A dedicated OS
//! thread owns the cpal host and stream; the device callback reads the
//! ring directly under its mutex and never touches the async runtime.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::oneshot;

use crate::framebuffer::FrameBuffer;
use crate::packet::{AudioHeader, BitResolution, Body, Header, SampleRate};
use crate::streams::IncomingStream;

/// The triple that must match between the stream and the open device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: SampleRate,
    pub channels: u16,
    pub bit_resolution: BitResolution,
}

impl StreamFormat {
    pub fn from_header(header: &AudioHeader) -> Self {
        Self {
            sample_rate: header.sample_rate,
            channels: header.channels,
            bit_resolution: header.bit_resolution,
        }
    }

    pub fn matches(&self, header: &AudioHeader) -> bool {
        self.sample_rate == header.sample_rate
            && self.channels == header.channels
            && self.bit_resolution == header.bit_resolution
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bit_resolution.byte_width()
    }

    /// Digital silence for this encoding: mid-scale for unsigned 8-bit
    /// PCM, zero for everything else
    pub fn silence_byte(&self) -> u8 {
        match self.bit_resolution {
            BitResolution::Byte8 => 0x80,
            _ => 0x00,
        }
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Rate48000,
            channels: 2,
            bit_resolution: BitResolution::Int16,
        }
    }
}

/// Playback tuning
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Output device name substring; the default device when `None`
    pub device: Option<String>,
    /// Format to open the device with before the first packet arrives
    pub format: StreamFormat,
    /// Frames per device buffer
    pub framebuffer_size: usize,
    /// Ring cap in frames; older frames are dropped beyond this
    pub max_framebuffer_size: usize,
    /// Probability that any one underflow or buffer-stat event is logged
    pub underflow_log_probability: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let framebuffer_size = 512;
        Self {
            device: None,
            format: StreamFormat::default(),
            framebuffer_size,
            max_framebuffer_size: framebuffer_size * 4,
            underflow_log_probability: 0.001,
        }
    }
}

/// Plays one incoming VBAN stream to a local output device
pub struct AudioPlayer {
    stream: Arc<IncomingStream>,
    config: PlayerConfig,
}

enum DeviceCommand {
    Open {
        format: StreamFormat,
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Ring and sync state handed to the audio output thread
#[derive(Clone)]
struct OutputShared {
    ring: Arc<FrameBuffer>,
    synced: Arc<AtomicBool>,
    cushion_frames: usize,
    log_probability: f64,
}

/// State shared with the device callback
struct RenderState {
    ring: Arc<FrameBuffer>,
    synced: Arc<AtomicBool>,
    cushion_frames: usize,
    log_probability: f64,
    bytes_per_frame: usize,
    silence: u8,
    sample_rate_hz: u32,
}

impl RenderState {
    /// Fill one device buffer from the ring.
    ///
    /// Until `cushion_frames` have accumulated the output is pure
    /// silence; afterwards reads are drop-oldest and any shortfall is
    /// concealed by prepending silence.
    fn fill(&self, out: &mut [u8]) {
        let frames_wanted = out.len() / self.bytes_per_frame;

        if !self.synced.load(Ordering::Acquire) {
            let (_, available) = self.ring.size();
            if available < self.cushion_frames {
                out.fill(self.silence);
                return;
            }
            self.synced.store(true, Ordering::Release);
        }

        if rand::random::<f64>() < self.log_probability {
            let (bytes, frames) = self.ring.size();
            tracing::debug!(
                "playback buffer: {bytes} bytes, {frames} frames (~{:.1} ms)",
                latency_ms(frames, self.sample_rate_hz)
            );
        }

        let (chunk, served, dropped) = self.ring.read(frames_wanted);
        if dropped > 0 {
            tracing::debug!("dropped {dropped} oldest frames to bound playback latency");
        }

        let pad = (frames_wanted - served) * self.bytes_per_frame;
        out[..pad].fill(self.silence);
        out[pad..pad + chunk.len()].copy_from_slice(&chunk);
        out[pad + chunk.len()..].fill(self.silence);

        if pad > 0 && rand::random::<f64>() < self.log_probability {
            tracing::info!(
                "playback underflow: {} frames short (~{:.1} ms)",
                frames_wanted - served,
                latency_ms(frames_wanted - served, self.sample_rate_hz)
            );
        }
    }
}

/// Estimated duration of `frames` at `sample_rate_hz`, for logging
fn latency_ms(frames: usize, sample_rate_hz: u32) -> f64 {
    frames as f64 / sample_rate_hz as f64 * 1000.0
}

/// cpal equivalent of a VBAN bit resolution, where one exists
pub(crate) fn cpal_sample_format(resolution: BitResolution) -> Option<cpal::SampleFormat> {
    match resolution {
        BitResolution::Byte8 => Some(cpal::SampleFormat::U8),
        BitResolution::Int16 => Some(cpal::SampleFormat::I16),
        BitResolution::Int32 => Some(cpal::SampleFormat::I32),
        BitResolution::Float32 => Some(cpal::SampleFormat::F32),
        BitResolution::Float64 => Some(cpal::SampleFormat::F64),
        BitResolution::Int24 | BitResolution::Bits12 | BitResolution::Bits10 => None,
    }
}

/// Find an audio device by name pattern (case-insensitive partial match),
/// falling back to the default device
pub(crate) fn find_device(
    host: &cpal::Host,
    name_pattern: Option<&str>,
    is_input: bool,
) -> Result<cpal::Device> {
    let devices: Vec<_> = if is_input {
        host.input_devices()?.collect()
    } else {
        host.output_devices()?.collect()
    };

    if let Some(pattern) = name_pattern {
        let pattern_lower = pattern.to_lowercase();
        for device in &devices {
            if let Ok(name) = device.name() {
                if name.to_lowercase().contains(&pattern_lower) {
                    tracing::info!(
                        "found {} device: {}",
                        if is_input { "input" } else { "output" },
                        name
                    );
                    return Ok(device.clone());
                }
            }
        }
    }

    let device = if is_input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };

    device.ok_or_else(|| {
        anyhow!(
            "no {} audio device found",
            if is_input { "input" } else { "output" }
        )
    })
}

fn open_output_stream(
    host: &cpal::Host,
    name_pattern: Option<&str>,
    format: StreamFormat,
    frames_per_buffer: usize,
    shared: &OutputShared,
) -> Result<cpal::Stream> {
    let device = find_device(host, name_pattern, false)?;
    tracing::info!("output device: {}", device.name().unwrap_or_default());

    let sample_format = cpal_sample_format(format.bit_resolution)
        .ok_or_else(|| anyhow!("{:?} is not playable by the audio backend", format.bit_resolution))?;
    let rate = format
        .sample_rate
        .hz()
        .ok_or_else(|| anyhow!("unknown sample-rate index {}", format.sample_rate.index()))?;

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Fixed(frames_per_buffer as u32),
    };

    let render = RenderState {
        ring: shared.ring.clone(),
        synced: shared.synced.clone(),
        cushion_frames: shared.cushion_frames,
        log_probability: shared.log_probability,
        bytes_per_frame: format.bytes_per_frame(),
        silence: format.silence_byte(),
        sample_rate_hz: rate,
    };

    let stream = device
        .build_output_stream_raw(
            &config,
            sample_format,
            move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                render.fill(data.bytes_mut());
            },
            move |err| {
                tracing::error!("output stream error: {err}");
            },
            None,
        )
        .context("failed to build output stream")?;
    Ok(stream)
}

fn output_thread(
    commands: mpsc::Receiver<DeviceCommand>,
    name_pattern: Option<String>,
    frames_per_buffer: usize,
    shared: OutputShared,
) {
    // The host handle lives and dies with this engine
    let host = cpal::default_host();
    let mut active: Option<cpal::Stream> = None;

    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Open { format, ack } => {
                // close the current device before opening the next one
                active = None;
                let result = open_output_stream(
                    &host,
                    name_pattern.as_deref(),
                    format,
                    frames_per_buffer,
                    &shared,
                )
                .and_then(|stream| {
                    stream.play().context("failed to start output stream")?;
                    active = Some(stream);
                    Ok(())
                });
                let _ = ack.send(result);
            }
            DeviceCommand::Shutdown => break,
        }
    }
    drop(active);
}

impl AudioPlayer {
    pub fn new(stream: Arc<IncomingStream>, config: PlayerConfig) -> Self {
        Self { stream, config }
    }

    async fn open_device(
        commands: &mpsc::Sender<DeviceCommand>,
        format: StreamFormat,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        commands
            .send(DeviceCommand::Open { format, ack })
            .map_err(|_| anyhow!("audio output thread is gone"))?;
        done.await
            .map_err(|_| anyhow!("audio output thread dropped the open request"))?
    }

    /// Run until the incoming stream closes. Device open failure on
    /// startup (or after a format change) is fatal.
    pub async fn run(self) -> Result<()> {
        let mut format = self.config.format;
        let ring = Arc::new(FrameBuffer::new(
            self.config.max_framebuffer_size,
            format.bytes_per_frame(),
        ));
        let synced = Arc::new(AtomicBool::new(false));

        let shared = OutputShared {
            ring: ring.clone(),
            synced: synced.clone(),
            cushion_frames: self.config.framebuffer_size * 2,
            log_probability: self.config.underflow_log_probability,
        };

        let (commands, command_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("vban-playback".into())
            .spawn({
                let name_pattern = self.config.device.clone();
                let frames_per_buffer = self.config.framebuffer_size;
                move || output_thread(command_rx, name_pattern, frames_per_buffer, shared)
            })?;

        Self::open_device(&commands, format).await?;
        tracing::info!(
            "playback started on stream {} ({} ch, {:?})",
            self.stream.name(),
            format.channels,
            format.bit_resolution
        );

        loop {
            let packet = match self.stream.pop().await {
                Ok(packet) => packet,
                Err(_) => break,
            };
            let Header::Audio(header) = packet.header else {
                continue;
            };

            if !format.matches(&header) {
                format = StreamFormat::from_header(&header);
                tracing::info!(
                    "stream {} now {} ch, {:?} @ {:?}; reopening output device",
                    header.stream_name,
                    format.channels,
                    format.bit_resolution,
                    format.sample_rate
                );
                synced.store(false, Ordering::Release);
                ring.synchronize(format.bytes_per_frame());
                Self::open_device(&commands, format).await?;
            }

            let Body::Pcm(data) = packet.body else {
                continue;
            };
            // bodies may carry trailing bytes; only whole frames enter
            // the ring
            let expected = header.body_len();
            let data = if data.len() > expected {
                &data[..expected]
            } else {
                &data[..]
            };
            let bytes_per_frame = format.bytes_per_frame();
            let frames = data.len() / bytes_per_frame;
            ring.write(&data[..frames * bytes_per_frame], frames);
        }

        let _ = commands.send(DeviceCommand::Shutdown);
        Ok(())
    }
}
