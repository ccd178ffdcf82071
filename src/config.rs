use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::registry::AppInfo;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Local bind for the VBAN listener
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-stream queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Identity advertised in ping responses
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Audio engine tuning
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Application name shown to pinging peers
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Device name shown to pinging peers
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default)]
    pub user_name: String,

    #[serde(default)]
    pub user_comment: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            device_name: default_device_name(),
            user_name: String::new(),
            user_comment: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    /// Frames per playback device buffer
    #[serde(default = "default_framebuffer_size")]
    pub framebuffer_size: usize,

    /// Playback ring cap in frames; older audio is dropped beyond this
    #[serde(default = "default_max_framebuffer_size")]
    pub max_framebuffer_size: usize,

    /// Frames per outgoing capture packet
    #[serde(default = "default_capture_frames")]
    pub capture_frames: usize,

    /// Capture packets per device read group
    #[serde(default = "default_sample_buffer_size")]
    pub sample_buffer_size: usize,

    /// Probability that any one underflow event is logged
    #[serde(default = "default_underflow_log_probability")]
    pub underflow_log_probability: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            framebuffer_size: default_framebuffer_size(),
            max_framebuffer_size: default_max_framebuffer_size(),
            capture_frames: default_capture_frames(),
            sample_buffer_size: default_sample_buffer_size(),
            underflow_log_probability: default_underflow_log_probability(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:6980".to_string()
}

fn default_queue_size() -> usize {
    100
}

fn default_application_name() -> String {
    "vban-bridge".to_string()
}

fn default_device_name() -> String {
    "vban-bridge".to_string()
}

fn default_framebuffer_size() -> usize {
    512
}

fn default_max_framebuffer_size() -> usize {
    2048
}

fn default_capture_frames() -> usize {
    128
}

fn default_sample_buffer_size() -> usize {
    3
}

fn default_underflow_log_probability() -> f64 {
    0.001
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            queue_size: default_queue_size(),
            identity: IdentityConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

/// `CARGO_PKG_VERSION` as ping version bytes
fn crate_version_bytes() -> [u8; 4] {
    let mut bytes = [0u8; 4];
    for (slot, part) in bytes.iter_mut().zip(env!("CARGO_PKG_VERSION").split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    bytes
}

impl Config {
    /// Load configuration from file, or return defaults if file doesn't exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// The identity the registry answers pings with
    pub fn app_info(&self) -> AppInfo {
        AppInfo {
            version: crate_version_bytes(),
            device_name: self.identity.device_name.clone(),
            application_name: self.identity.application_name.clone(),
            user_name: self.identity.user_name.clone(),
            user_comment: self.identity.user_comment.clone(),
            ..AppInfo::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0:6980");
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.identity.application_name, "vban-bridge");
        assert_eq!(config.audio.framebuffer_size, 512);
        assert_eq!(config.audio.max_framebuffer_size, 2048);
        assert_eq!(config.audio.capture_frames, 128);
        assert_eq!(config.audio.sample_buffer_size, 3);
        assert!((config.audio.underflow_log_probability - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_config_load_nonexistent_returns_default() {
        let config = Config::load("/nonexistent/path/to/config.toml").unwrap();
        assert_eq!(config.bind, "0.0.0.0:6980");
        assert_eq!(config.queue_size, 100);
    }

    #[test]
    fn test_config_load_valid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind = "127.0.0.1:7000"
queue_size = 50

[identity]
application_name = "studio-bridge"
user_name = "operator"

[audio]
framebuffer_size = 256
underflow_log_probability = 0.01
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bind, "127.0.0.1:7000");
        assert_eq!(config.queue_size, 50);
        assert_eq!(config.identity.application_name, "studio-bridge");
        assert_eq!(config.identity.user_name, "operator");
        assert_eq!(config.audio.framebuffer_size, 256);
        assert!((config.audio.underflow_log_probability - 0.01).abs() < 1e-9);
        // untouched fields keep their defaults
        assert_eq!(config.identity.device_name, "vban-bridge");
        assert_eq!(config.audio.capture_frames, 128);
    }

    #[test]
    fn test_config_load_partial_toml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"bind = "0.0.0.0:9000""#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.audio.framebuffer_size, 512);
    }

    #[test]
    fn test_config_load_invalid_toml_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not valid toml {{{{").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_config_empty_file_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bind, "0.0.0.0:6980");
    }

    #[test]
    fn test_app_info_reflects_identity() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[identity]
application_name = "studio-bridge"
device_name = "rack-42"
user_comment = "control room"
"#
        )
        .unwrap();

        let app = Config::load(file.path()).unwrap().app_info();
        assert_eq!(app.application_name, "studio-bridge");
        assert_eq!(app.device_name, "rack-42");
        assert_eq!(app.user_comment, "control room");
    }

    #[test]
    fn test_crate_version_bytes_match_package() {
        let bytes = crate_version_bytes();
        let rendered = format!("{}.{}.{}", bytes[0], bytes[1], bytes[2]);
        assert!(env!("CARGO_PKG_VERSION").starts_with(&rendered));
    }
}
