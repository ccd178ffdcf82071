use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use vban_bridge::capture::{AudioCapture, CaptureConfig};
use vban_bridge::config::Config;
use vban_bridge::packet::{BaudRate, BitResolution, SampleRate, VBAN_PORT};
use vban_bridge::player::{AudioPlayer, PlayerConfig, StreamFormat};
use vban_bridge::queue::OverflowPolicy;
use vban_bridge::registry::Registry;
use vban_bridge::transport::Listener;

/// VBAN audio-over-network bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vban-bridge/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive VBAN streams and play them to a local device
    Receive {
        /// Streams to play, as host[:port]/streamname
        #[arg(required = true)]
        peers: Vec<String>,

        /// Local listener bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,

        /// Output device name substring
        #[arg(long)]
        output_device: Option<String>,

        /// Channel count to open the device with
        #[arg(long, default_value_t = 2)]
        channels: u16,

        /// Sample rate to open the device with, in Hz
        #[arg(long, default_value_t = 48000)]
        rate: u32,
    },

    /// Capture a local device and send it as a VBAN stream
    Send {
        /// Remote host[:port]
        target: String,

        /// Stream name to send under
        stream: String,

        /// Input device name substring
        #[arg(long)]
        input_device: Option<String>,

        #[arg(long, default_value_t = 2)]
        channels: u16,

        /// Sample rate in Hz
        #[arg(long, default_value_t = 48000)]
        rate: u32,

        /// Frames per packet (overrides the config file)
        #[arg(long)]
        frames: Option<usize>,
    },

    /// Send one command string over a text stream
    SendText {
        /// Remote host[:port]
        target: String,

        /// Stream name to send under
        stream: String,

        /// Command text, e.g. "Strip[0].Gain = 0.5;"
        text: String,
    },
}

/// Split `host[:port]`, defaulting to the VBAN port
fn parse_host_port(spec: &str) -> Result<(String, u16)> {
    match spec.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in {spec:?}"))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((spec.to_owned(), VBAN_PORT)),
    }
}

/// Split `host[:port]/streamname`
fn parse_peer_spec(spec: &str) -> Result<(String, u16, String)> {
    let (target, stream) = spec
        .split_once('/')
        .ok_or_else(|| anyhow!("expected host[:port]/streamname, got {spec:?}"))?;
    if stream.is_empty() {
        return Err(anyhow!("missing stream name in {spec:?}"));
    }
    let (host, port) = parse_host_port(target)?;
    Ok((host, port, stream.to_owned()))
}

fn stream_format(rate: u32, channels: u16) -> Result<StreamFormat> {
    if channels == 0 || channels > 256 {
        return Err(anyhow!("channel count {channels} outside 1-256"));
    }
    let sample_rate = SampleRate::from_hz(rate)
        .ok_or_else(|| anyhow!("{rate} Hz is not a VBAN sample rate"))?;
    Ok(StreamFormat {
        sample_rate,
        channels,
        bit_resolution: BitResolution::Int16,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("vban_bridge=debug")
    } else {
        EnvFilter::new("vban_bridge=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)?;

    match args.command {
        Command::Receive {
            peers,
            bind,
            output_device,
            channels,
            rate,
        } => run_receive(config, peers, bind, output_device, channels, rate).await,
        Command::Send {
            target,
            stream,
            input_device,
            channels,
            rate,
            frames,
        } => run_send(config, target, stream, input_device, channels, rate, frames).await,
        Command::SendText {
            target,
            stream,
            text,
        } => run_send_text(config, target, stream, text).await,
    }
}

async fn run_receive(
    config: Config,
    peers: Vec<String>,
    bind: Option<String>,
    output_device: Option<String>,
    channels: u16,
    rate: u32,
) -> Result<()> {
    let registry = Arc::new(Registry::with_queue_size(
        config.app_info(),
        config.queue_size,
    ));

    let bind = bind.unwrap_or_else(|| config.bind.clone());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind:?}"))?;
    let listener = Listener::bind(bind_addr)
        .await
        .context("failed to bind VBAN listener")?;

    let format = stream_format(rate, channels)?;
    let mut players = tokio::task::JoinSet::new();
    for spec in &peers {
        let (host, port, stream_name) = parse_peer_spec(spec)?;
        let peer = registry.register(&host, port)?;
        let stream = peer.receive_stream(&stream_name, OverflowPolicy::Block);
        tracing::info!("playing stream {stream_name} from {host}:{port}");

        players.spawn(
            AudioPlayer::new(
                stream,
                PlayerConfig {
                    device: output_device.clone(),
                    format,
                    framebuffer_size: config.audio.framebuffer_size,
                    max_framebuffer_size: config.audio.max_framebuffer_size,
                    underflow_log_probability: config.audio.underflow_log_probability,
                },
            )
            .run(),
        );
    }

    tracing::info!("receiving. Press Ctrl+C to stop.");
    tokio::select! {
        result = listener.run(registry) => {
            result.context("VBAN listener failed")?;
        }
        Some(finished) = players.join_next() => {
            finished.context("playback task panicked")??;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn run_send(
    config: Config,
    target: String,
    stream: String,
    input_device: Option<String>,
    channels: u16,
    rate: u32,
    frames: Option<usize>,
) -> Result<()> {
    let registry = Arc::new(Registry::with_queue_size(
        config.app_info(),
        config.queue_size,
    ));
    let (host, port) = parse_host_port(&target)?;
    let peer = registry.register(&host, port)?;
    let outgoing = peer.send_stream(&stream).await?;
    tracing::info!("sending stream {stream} to {host}:{port}");

    let capture = AudioCapture::new(
        outgoing,
        CaptureConfig {
            device: input_device,
            format: stream_format(rate, channels)?,
            framebuffer_size: frames.unwrap_or(config.audio.capture_frames),
            sample_buffer_size: config.audio.sample_buffer_size,
        },
    );

    tokio::select! {
        result = capture.run() => {
            result.context("capture engine failed")?;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn run_send_text(
    config: Config,
    target: String,
    stream: String,
    text: String,
) -> Result<()> {
    let registry = Registry::with_queue_size(config.app_info(), config.queue_size);
    let (host, port) = parse_host_port(&target)?;
    let peer = registry.register(&host, port)?;

    let text_stream = peer.text_stream(&stream, BaudRate::Baud256000).await?;
    text_stream.send_text(&text).await?;
    tracing::info!("sent {:?} to {host}:{port}", text);
    Ok(())
}
