//! Service-packet payloads
//!
//! Two fixed-layout bodies ride the service sub-protocol: the 676-byte
//! identification ping exchanged under the reserved `"VBAN Service"`
//! stream name, and the 1384-byte real-time state snapshot a Voicemeeter
//! host emits to registered listeners. Both are little-endian with
//! NUL-padded fixed-width strings.

use bytes::{Buf, BufMut};

use crate::packet::{vban_text, BodyError};

/// Wire size of an identification ping body
pub const PING_BODY_SIZE: usize = 676;

/// Minimum wire size of a type-0 RT packet body
pub const RT_PACKET_BODY_SIZE: usize = 1384;

bitflags::bitflags! {
    /// What kind of endpoint a ping describes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceType: u32 {
        const RECEPTOR         = 0x0000_0001;
        const TRANSMITTER      = 0x0000_0002;
        const RECEPTOR_SPOT    = 0x0000_0004;
        const TRANSMITTER_SPOT = 0x0000_0008;
        const VIRTUAL_DEVICE   = 0x0000_0010;
        const VIRTUAL_MIXER    = 0x0000_0020;
        const MATRIX           = 0x0000_0040;
        const DAW              = 0x0000_0080;
        const SERVER           = 0x0100_0000;
    }
}

bitflags::bitflags! {
    /// Capabilities advertised in a ping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const AUDIO  = 0x0000_0001;
        const AOIP   = 0x0000_0002;
        const VOIP   = 0x0000_0004;
        const SERIAL = 0x0000_0100;
        const MIDI   = 0x0000_0300;
        const FRAME  = 0x0000_1000;
        const TEXT   = 0x0001_0000;
    }
}

bitflags::bitflags! {
    /// Per-strip / per-bus state word in an RT packet.
    ///
    /// The mixdown/upmix selector occupies bits 4-7 as a four-bit value
    /// and the pan selector bits 20-23; `from_bits_retain` keeps them
    /// intact even though they are not individual flags here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelMode: u32 {
        const MUTE      = 0x0000_0001;
        const SOLO      = 0x0000_0002;
        const MONO      = 0x0000_0004;
        const MUTE_C    = 0x0000_0008;
        const EQ        = 0x0000_0100;
        const CROSS     = 0x0000_0200;
        const EQ_B      = 0x0000_0800;
        const BUS_A1    = 0x0000_1000;
        const BUS_A2    = 0x0000_2000;
        const BUS_A3    = 0x0000_4000;
        const BUS_A4    = 0x0000_8000;
        const BUS_A5    = 0x0008_0000;
        const BUS_B1    = 0x0001_0000;
        const BUS_B2    = 0x0002_0000;
        const BUS_B3    = 0x0004_0000;
        const POSTFX_R  = 0x0100_0000;
        const POSTFX_D  = 0x0200_0000;
        const POSTFX_1  = 0x0400_0000;
        const POSTFX_2  = 0x0800_0000;
        const SEL       = 0x1000_0000;
        const MONITOR   = 0x2000_0000;
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for ChannelMode {
    fn default() -> Self {
        Self::empty()
    }
}

/// Voicemeeter edition byte at the start of an RT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoicemeeterEdition {
    #[default]
    Voicemeeter,
    Banana,
    Potato,
    Unknown(u8),
}

impl VoicemeeterEdition {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Voicemeeter,
            2 => Self::Banana,
            3 => Self::Potato,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Voicemeeter => 1,
            Self::Banana => 2,
            Self::Potato => 3,
            Self::Unknown(byte) => byte,
        }
    }
}

fn get_string(buf: &mut &[u8], width: usize) -> String {
    let text = vban_text(&buf[..width]);
    buf.advance(width);
    text
}

fn put_string(buf: &mut &mut [u8], text: &str, width: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(width);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

/// Identification ping body, symmetric between requests and responses.
///
/// Rate fields carry Hz. The version renders as `a.b.c.d` but is stored
/// on the wire in reverse byte order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub device_type: DeviceType,
    pub features: Features,
    pub feature_extra: u32,
    pub preferred_rate: u32,
    pub min_rate: u32,
    pub max_rate: u32,
    pub color_rgb: u32,
    /// `[a, b, c, d]` of the rendered `a.b.c.d`
    pub version: [u8; 4],
    pub gps_position: String,
    pub user_position: String,
    pub lang_code: String,
    pub reserved: [u8; 8],
    pub reserved_ex: [u8; 64],
    pub distant_ip: String,
    pub distant_port: u16,
    pub distant_reserved: u16,
    pub device_name: String,
    pub manufacturer_name: String,
    pub application_name: String,
    pub host_name: String,
    pub user_name: String,
    pub user_comment: String,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            features: Features::default(),
            feature_extra: 0,
            preferred_rate: 0,
            min_rate: 0,
            max_rate: 0,
            color_rgb: 0,
            version: [0; 4],
            gps_position: String::new(),
            user_position: String::new(),
            lang_code: String::new(),
            reserved: [0; 8],
            reserved_ex: [0; 64],
            distant_ip: String::new(),
            distant_port: 0,
            distant_reserved: 0,
            device_name: String::new(),
            manufacturer_name: String::new(),
            application_name: String::new(),
            host_name: String::new(),
            user_name: String::new(),
            user_comment: String::new(),
        }
    }
}

impl Ping {
    /// Decode a ping body. Bodies shorter than 676 bytes are right-padded
    /// with NUL before decoding, so this never fails.
    pub fn decode(data: &[u8]) -> Self {
        let mut padded = [0u8; PING_BODY_SIZE];
        let len = data.len().min(PING_BODY_SIZE);
        padded[..len].copy_from_slice(&data[..len]);

        let mut buf = &padded[..];
        let device_type = DeviceType::from_bits_retain(buf.get_u32_le());
        let features = Features::from_bits_retain(buf.get_u32_le());
        let feature_extra = buf.get_u32_le();
        let preferred_rate = buf.get_u32_le();
        let min_rate = buf.get_u32_le();
        let max_rate = buf.get_u32_le();
        let color_rgb = buf.get_u32_le();

        let mut wire_version = [0u8; 4];
        buf.copy_to_slice(&mut wire_version);
        let version = [
            wire_version[3],
            wire_version[2],
            wire_version[1],
            wire_version[0],
        ];

        let gps_position = get_string(&mut buf, 8);
        let user_position = get_string(&mut buf, 8);
        let lang_code = get_string(&mut buf, 8);
        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut reserved_ex = [0u8; 64];
        buf.copy_to_slice(&mut reserved_ex);
        let distant_ip = get_string(&mut buf, 32);
        let distant_port = buf.get_u16_le();
        let distant_reserved = buf.get_u16_le();
        let device_name = get_string(&mut buf, 64);
        let manufacturer_name = get_string(&mut buf, 64);
        let application_name = get_string(&mut buf, 64);
        let host_name = get_string(&mut buf, 64);
        let user_name = get_string(&mut buf, 128);
        let user_comment = get_string(&mut buf, 128);

        Self {
            device_type,
            features,
            feature_extra,
            preferred_rate,
            min_rate,
            max_rate,
            color_rgb,
            version,
            gps_position,
            user_position,
            lang_code,
            reserved,
            reserved_ex,
            distant_ip,
            distant_port,
            distant_reserved,
            device_name,
            manufacturer_name,
            application_name,
            host_name,
            user_name,
            user_comment,
        }
    }

    /// Encode to the full 676-byte wire layout
    pub fn encode(&self) -> [u8; PING_BODY_SIZE] {
        let mut out = [0u8; PING_BODY_SIZE];
        let mut buf = &mut out[..];

        buf.put_u32_le(self.device_type.bits());
        buf.put_u32_le(self.features.bits());
        buf.put_u32_le(self.feature_extra);
        buf.put_u32_le(self.preferred_rate);
        buf.put_u32_le(self.min_rate);
        buf.put_u32_le(self.max_rate);
        buf.put_u32_le(self.color_rgb);
        buf.put_slice(&[
            self.version[3],
            self.version[2],
            self.version[1],
            self.version[0],
        ]);
        put_string(&mut buf, &self.gps_position, 8);
        put_string(&mut buf, &self.user_position, 8);
        put_string(&mut buf, &self.lang_code, 8);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.reserved_ex);
        put_string(&mut buf, &self.distant_ip, 32);
        buf.put_u16_le(self.distant_port);
        buf.put_u16_le(self.distant_reserved);
        put_string(&mut buf, &self.device_name, 64);
        put_string(&mut buf, &self.manufacturer_name, 64);
        put_string(&mut buf, &self.application_name, 64);
        put_string(&mut buf, &self.host_name, 64);
        put_string(&mut buf, &self.user_name, 128);
        put_string(&mut buf, &self.user_comment, 128);

        out
    }

    /// Rendered version, e.g. `"3.0.2.8"`
    pub fn version_string(&self) -> String {
        let [a, b, c, d] = self.version;
        format!("{a}.{b}.{c}.{d}")
    }
}

/// One input strip in an RT snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtStrip {
    pub label: String,
    pub state: ChannelMode,
    /// Gain per bus layer, layer-major on the wire
    pub layer_gains: [u16; 8],
}

/// One output bus in an RT snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtBus {
    pub label: String,
    pub state: ChannelMode,
    pub gain: u16,
}

/// Type-0 real-time packet: a full Voicemeeter mixer state snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RtPacket {
    pub edition: VoicemeeterEdition,
    pub reserved: u8,
    pub buffer_size: u16,
    /// Rendered in wire order, e.g. `"3.0.2.8"`
    pub version: [u8; 4],
    pub option_bits: u32,
    pub sample_rate: u32,
    pub input_levels: [u16; 34],
    pub output_levels: [u16; 64],
    pub transport_bits: u32,
    pub strips: [RtStrip; 8],
    pub buses: [RtBus; 8],
}

impl Default for RtPacket {
    fn default() -> Self {
        Self {
            edition: VoicemeeterEdition::default(),
            reserved: 0,
            buffer_size: 0,
            version: [0; 4],
            option_bits: 0,
            sample_rate: 0,
            input_levels: [0; 34],
            output_levels: [0; 64],
            transport_bits: 0,
            strips: std::array::from_fn(|_| RtStrip::default()),
            buses: std::array::from_fn(|_| RtBus::default()),
        }
    }
}

impl RtPacket {
    /// Decode a type-0 RT body; requires the full 1384-byte layout
    pub fn decode(data: &[u8]) -> Result<Self, BodyError> {
        if data.len() < RT_PACKET_BODY_SIZE {
            return Err(BodyError::TooShort {
                wanted: RT_PACKET_BODY_SIZE,
                got: data.len(),
            });
        }

        let mut buf = &data[..RT_PACKET_BODY_SIZE];
        let edition = VoicemeeterEdition::from_byte(buf.get_u8());
        let reserved = buf.get_u8();
        let buffer_size = buf.get_u16_le();
        let mut version = [0u8; 4];
        buf.copy_to_slice(&mut version);
        let option_bits = buf.get_u32_le();
        let sample_rate = buf.get_u32_le();

        let mut input_levels = [0u16; 34];
        for level in &mut input_levels {
            *level = buf.get_u16_le();
        }
        let mut output_levels = [0u16; 64];
        for level in &mut output_levels {
            *level = buf.get_u16_le();
        }
        let transport_bits = buf.get_u32_le();

        let mut strip_states = [0u32; 8];
        for state in &mut strip_states {
            *state = buf.get_u32_le();
        }
        let mut bus_states = [0u32; 8];
        for state in &mut bus_states {
            *state = buf.get_u32_le();
        }

        // Layer gains are layer-major on the wire: all strips for layer 0,
        // then all strips for layer 1, and so on.
        let mut layer_gains = [[0u16; 8]; 8];
        for layer in &mut layer_gains {
            for strip in layer.iter_mut() {
                *strip = buf.get_u16_le();
            }
        }
        let mut bus_gains = [0u16; 8];
        for gain in &mut bus_gains {
            *gain = buf.get_u16_le();
        }

        let mut strip_names: [String; 8] = Default::default();
        for name in &mut strip_names {
            *name = get_string(&mut buf, 60);
        }
        let mut bus_names: [String; 8] = Default::default();
        for name in &mut bus_names {
            *name = get_string(&mut buf, 60);
        }

        let strips = std::array::from_fn(|i| RtStrip {
            label: std::mem::take(&mut strip_names[i]),
            state: ChannelMode::from_bits_retain(strip_states[i]),
            layer_gains: std::array::from_fn(|layer| layer_gains[layer][i]),
        });
        let buses = std::array::from_fn(|i| RtBus {
            label: std::mem::take(&mut bus_names[i]),
            state: ChannelMode::from_bits_retain(bus_states[i]),
            gain: bus_gains[i],
        });

        Ok(Self {
            edition,
            reserved,
            buffer_size,
            version,
            option_bits,
            sample_rate,
            input_levels,
            output_levels,
            transport_bits,
            strips,
            buses,
        })
    }

    /// Encode to the exact 1384-byte wire layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; RT_PACKET_BODY_SIZE];
        let mut buf = &mut out[..];

        buf.put_u8(self.edition.as_byte());
        buf.put_u8(self.reserved);
        buf.put_u16_le(self.buffer_size);
        buf.put_slice(&self.version);
        buf.put_u32_le(self.option_bits);
        buf.put_u32_le(self.sample_rate);
        for level in self.input_levels {
            buf.put_u16_le(level);
        }
        for level in self.output_levels {
            buf.put_u16_le(level);
        }
        buf.put_u32_le(self.transport_bits);
        for strip in &self.strips {
            buf.put_u32_le(strip.state.bits());
        }
        for bus in &self.buses {
            buf.put_u32_le(bus.state.bits());
        }
        for layer in 0..8 {
            for strip in &self.strips {
                buf.put_u16_le(strip.layer_gains[layer]);
            }
        }
        for bus in &self.buses {
            buf.put_u16_le(bus.gain);
        }
        for strip in &self.strips {
            put_string(&mut buf, &strip.label, 60);
        }
        for bus in &self.buses {
            put_string(&mut buf, &bus.label, 60);
        }

        out
    }

    /// Rendered Voicemeeter version string
    pub fn version_string(&self) -> String {
        let [a, b, c, d] = self.version;
        format!("{a}.{b}.{c}.{d}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_ping() -> Ping {
        Ping {
            device_type: DeviceType::RECEPTOR,
            features: Features::AUDIO | Features::TEXT,
            feature_extra: 0,
            preferred_rate: 44100,
            min_rate: 6000,
            max_rate: 705600,
            color_rgb: 0x00FF_FFFF,
            version: [1, 0, 2, 1],
            gps_position: "GPS".into(),
            user_position: "UserPos".into(),
            lang_code: "EN".into(),
            reserved: [0u8; 8],
            reserved_ex: [0u8; 64],
            distant_ip: "192.168.1.1".into(),
            distant_port: 6980,
            distant_reserved: 0,
            device_name: "Device".into(),
            manufacturer_name: "Manufacturer".into(),
            application_name: "App".into(),
            host_name: "Host".into(),
            user_name: "User".into(),
            user_comment: "Comment".into(),
        }
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = sample_ping();
        let encoded = ping.encode();
        assert_eq!(encoded.len(), PING_BODY_SIZE);

        let decoded = Ping::decode(&encoded);
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_ping_fixture_reencodes_identically() {
        // decode(fixture).encode() == fixture for a fully NUL-padded body
        let fixture = sample_ping().encode();
        let reencoded = Ping::decode(&fixture).encode();
        assert_eq!(reencoded.as_slice(), fixture.as_slice());
    }

    #[test]
    fn test_ping_version_wire_order() {
        // rendered a.b.c.d is stored d,c,b,a on the wire
        let ping = Ping {
            version: [1, 2, 3, 4],
            ..Ping::default()
        };
        let encoded = ping.encode();
        assert_eq!(&encoded[28..32], &[4, 3, 2, 1]);
        assert_eq!(Ping::decode(&encoded).version_string(), "1.2.3.4");
    }

    #[test]
    fn test_ping_short_body_padded() {
        let mut short = sample_ping().encode()[..100].to_vec();
        short.truncate(100);
        let decoded = Ping::decode(&short);
        assert_eq!(decoded.device_type, DeviceType::RECEPTOR);
        assert_eq!(decoded.preferred_rate, 44100);
        // everything past the truncation decodes as zero / empty
        assert_eq!(decoded.distant_port, 0);
        assert_eq!(decoded.device_name, "");
        // and re-encoding always yields the full width
        assert_eq!(decoded.encode().len(), PING_BODY_SIZE);
    }

    #[test]
    fn test_ping_empty_body_decodes() {
        let decoded = Ping::decode(&[]);
        assert_eq!(decoded, Ping::default());
    }

    #[test]
    fn test_ping_string_truncation() {
        let ping = Ping {
            lang_code: "way too long for eight bytes".into(),
            ..Ping::default()
        };
        let decoded = Ping::decode(&ping.encode());
        assert_eq!(decoded.lang_code, "way too ");
    }

    fn sample_rt_packet() -> RtPacket {
        let mut packet = RtPacket {
            edition: VoicemeeterEdition::Banana,
            reserved: 0,
            buffer_size: 512,
            version: [2, 1, 1, 4],
            option_bits: 0,
            sample_rate: 48000,
            transport_bits: 0x0000_0012,
            ..RtPacket::default()
        };
        for (i, level) in packet.input_levels.iter_mut().enumerate() {
            *level = i as u16 * 100;
        }
        for (i, level) in packet.output_levels.iter_mut().enumerate() {
            *level = i as u16;
        }
        for (i, strip) in packet.strips.iter_mut().enumerate() {
            strip.label = format!("Strip {i}");
            strip.state = ChannelMode::MUTE | ChannelMode::BUS_A1;
            strip.layer_gains = std::array::from_fn(|layer| (layer * 8 + i) as u16);
        }
        for (i, bus) in packet.buses.iter_mut().enumerate() {
            bus.label = format!("Bus {i}");
            bus.state = ChannelMode::EQ;
            bus.gain = 0x1234 + i as u16;
        }
        packet
    }

    #[test]
    fn test_rt_packet_roundtrip() {
        let packet = sample_rt_packet();
        let encoded = packet.encode();
        assert_eq!(encoded.len(), RT_PACKET_BODY_SIZE);

        let decoded = RtPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_rt_packet_exact_minimum_size() {
        let encoded = sample_rt_packet().encode();
        assert!(RtPacket::decode(&encoded).is_ok());
        assert_eq!(
            RtPacket::decode(&encoded[..RT_PACKET_BODY_SIZE - 1]),
            Err(BodyError::TooShort {
                wanted: RT_PACKET_BODY_SIZE,
                got: RT_PACKET_BODY_SIZE - 1,
            })
        );
    }

    #[test]
    fn test_rt_packet_layer_gains_are_layer_major() {
        let encoded = sample_rt_packet().encode();
        // layer-major region starts at offset 280
        for layer in 0..8 {
            for strip in 0..8 {
                let offset = 280 + (layer * 8 + strip) * 2;
                let gain = u16::from_le_bytes([encoded[offset], encoded[offset + 1]]);
                assert_eq!(gain, (layer * 8 + strip) as u16);
            }
        }
    }

    #[test]
    fn test_rt_packet_name_offsets() {
        let encoded = sample_rt_packet().encode();
        assert_eq!(&encoded[424..431], b"Strip 0");
        assert_eq!(&encoded[904..909], b"Bus 0");
    }

    #[test]
    fn test_rt_packet_trailing_bytes_ignored() {
        let mut encoded = sample_rt_packet().encode();
        encoded.extend_from_slice(&[0xFF; 32]);
        let decoded = RtPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, sample_rt_packet());
    }

    #[test]
    fn test_voicemeeter_edition_bytes() {
        assert_eq!(
            VoicemeeterEdition::from_byte(2),
            VoicemeeterEdition::Banana
        );
        assert_eq!(VoicemeeterEdition::from_byte(9).as_byte(), 9);
    }

    #[test]
    fn test_channel_mode_retains_unknown_bits() {
        // the 4-bit mixdown selector is not an individual flag
        let state = ChannelMode::from_bits_retain(0x0000_0071);
        assert!(state.contains(ChannelMode::MUTE));
        assert_eq!(state.bits(), 0x0000_0071);
    }
}
