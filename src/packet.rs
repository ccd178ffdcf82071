//! VBAN wire protocol: the 28-byte header and packet framing
//!
//! VBAN (VB-Audio Network) multiplexes audio, serial, text and service
//! sub-protocols over UDP. Every datagram starts with the same 28-byte
//! header; the upper three bits of byte 4 select the sub-protocol and
//! decide how bytes 4-7 are interpreted.
//! Default port: 6980

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::service::{Ping, RtPacket};

/// VBAN magic header bytes
pub const VBAN_MAGIC: &[u8; 4] = b"VBAN";

/// Default VBAN UDP port
pub const VBAN_PORT: u16 = 6980;

/// VBAN header size in bytes
pub const VBAN_HEADER_SIZE: usize = 28;

/// Stream name field width on the wire
pub const VBAN_STREAM_NAME_SIZE: usize = 16;

/// Receivers must accept datagrams up to this size
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Emitted audio packets (header + body) should stay under this so they
/// fit a typical Ethernet MTU after IP/UDP headers
pub const MAX_AUDIO_PACKET_SIZE: usize = 1436;

/// Service header `function` value for requests
pub const SERVICE_FUNCTION_REQUEST: u8 = 0x00;

/// Service header `function` value for responses
pub const SERVICE_FUNCTION_RESPONSE: u8 = 0x80;

/// Header-level decode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("datagram too short for a VBAN header: {0} bytes")]
    TooShort(usize),
    #[error("missing VBAN magic")]
    BadMagic,
    #[error("framecount field could not be read")]
    FramecountDecode,
}

/// Body-level decode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("body too short: wanted {wanted} bytes, got {got}")]
    TooShort { wanted: usize, got: usize },
    #[error("invalid UTF-8 at byte {pos}, decoding as latin-1")]
    InvalidUtf8 { pos: usize },
    #[error("bad field: {0}")]
    BadField(&'static str),
}

/// Failures when assembling or parsing a whole packet
#[derive(Debug, Error)]
pub enum PacketError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Body(#[from] BodyError),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}

/// VBAN sub-protocols, upper 3 bits of byte 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocol {
    Audio,
    Serial,
    Text,
    Service,
    Undefined1,
    Undefined2,
    Undefined3,
    User,
}

impl SubProtocol {
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0xE0 {
            0x00 => Self::Audio,
            0x20 => Self::Serial,
            0x40 => Self::Text,
            0x60 => Self::Service,
            0x80 => Self::Undefined1,
            0xA0 => Self::Undefined2,
            0xC0 => Self::Undefined3,
            _ => Self::User,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Audio => 0x00,
            Self::Serial => 0x20,
            Self::Text => 0x40,
            Self::Service => 0x60,
            Self::Undefined1 => 0x80,
            Self::Undefined2 => 0xA0,
            Self::Undefined3 => 0xC0,
            Self::User => 0xE0,
        }
    }
}

/// Sample rates addressable by the 5-bit index in audio headers.
///
/// The index order interleaves the 48k, 44.1k and 8k families; see the
/// table in `RATE_TABLE`. Indices 21-31 are unassigned and round-trip
/// through [`SampleRate::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    Rate6000,
    Rate12000,
    Rate24000,
    Rate48000,
    Rate96000,
    Rate192000,
    Rate384000,
    Rate8000,
    Rate16000,
    Rate32000,
    Rate64000,
    Rate128000,
    Rate256000,
    Rate512000,
    Rate11025,
    Rate22050,
    Rate44100,
    Rate88200,
    Rate176400,
    Rate352800,
    Rate705600,
    Unknown(u8),
}

/// Hz by wire index
const RATE_TABLE: &[u32] = &[
    6000, 12000, 24000, 48000, 96000, 192000, 384000, // 0-6
    8000, 16000, 32000, 64000, 128000, 256000, 512000, // 7-13
    11025, 22050, 44100, 88200, 176400, 352800, // 14-19
    705600, // 20
];

impl SampleRate {
    pub fn from_index(index: u8) -> Self {
        match index & 0x1F {
            0 => Self::Rate6000,
            1 => Self::Rate12000,
            2 => Self::Rate24000,
            3 => Self::Rate48000,
            4 => Self::Rate96000,
            5 => Self::Rate192000,
            6 => Self::Rate384000,
            7 => Self::Rate8000,
            8 => Self::Rate16000,
            9 => Self::Rate32000,
            10 => Self::Rate64000,
            11 => Self::Rate128000,
            12 => Self::Rate256000,
            13 => Self::Rate512000,
            14 => Self::Rate11025,
            15 => Self::Rate22050,
            16 => Self::Rate44100,
            17 => Self::Rate88200,
            18 => Self::Rate176400,
            19 => Self::Rate352800,
            20 => Self::Rate705600,
            other => Self::Unknown(other),
        }
    }

    /// Look up the index for a rate in Hz
    pub fn from_hz(hz: u32) -> Option<Self> {
        RATE_TABLE
            .iter()
            .position(|&rate| rate == hz)
            .map(|index| Self::from_index(index as u8))
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Rate6000 => 0,
            Self::Rate12000 => 1,
            Self::Rate24000 => 2,
            Self::Rate48000 => 3,
            Self::Rate96000 => 4,
            Self::Rate192000 => 5,
            Self::Rate384000 => 6,
            Self::Rate8000 => 7,
            Self::Rate16000 => 8,
            Self::Rate32000 => 9,
            Self::Rate64000 => 10,
            Self::Rate128000 => 11,
            Self::Rate256000 => 12,
            Self::Rate512000 => 13,
            Self::Rate11025 => 14,
            Self::Rate22050 => 15,
            Self::Rate44100 => 16,
            Self::Rate88200 => 17,
            Self::Rate176400 => 18,
            Self::Rate352800 => 19,
            Self::Rate705600 => 20,
            Self::Unknown(index) => index & 0x1F,
        }
    }

    /// Rate in Hz, `None` for unassigned indices
    pub fn hz(self) -> Option<u32> {
        match self {
            Self::Unknown(_) => None,
            known => RATE_TABLE.get(known.index() as usize).copied(),
        }
    }
}

/// PCM sample encodings, low 3 bits of an audio header's byte 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitResolution {
    Byte8,
    Int16,
    Int24,
    Int32,
    Float32,
    Float64,
    Bits12,
    Bits10,
}

impl BitResolution {
    pub fn from_code(code: u8) -> Self {
        match code & 0x07 {
            0 => Self::Byte8,
            1 => Self::Int16,
            2 => Self::Int24,
            3 => Self::Int32,
            4 => Self::Float32,
            5 => Self::Float64,
            6 => Self::Bits12,
            _ => Self::Bits10,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Byte8 => 0,
            Self::Int16 => 1,
            Self::Int24 => 2,
            Self::Int32 => 3,
            Self::Float32 => 4,
            Self::Float64 => 5,
            Self::Bits12 => 6,
            Self::Bits10 => 7,
        }
    }

    /// Bytes one sample occupies on the wire
    pub fn byte_width(self) -> usize {
        match self {
            Self::Byte8 => 1,
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 => 4,
            Self::Float32 => 4,
            Self::Float64 => 8,
            Self::Bits12 => 4,
            Self::Bits10 => 2,
        }
    }
}

/// Audio codecs, high nibble of an audio header's byte 7.
///
/// Only PCM payloads are ever encoded or decoded by this crate; the
/// compressed codecs are recognized enumerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcm,
    Vbca,
    Vbcv,
    User,
    Undefined(u8),
}

impl Codec {
    pub fn from_code(code: u8) -> Self {
        match code & 0xF0 {
            0x00 => Self::Pcm,
            0x10 => Self::Vbca,
            0x20 => Self::Vbcv,
            0xF0 => Self::User,
            other => Self::Undefined(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Pcm => 0x00,
            Self::Vbca => 0x10,
            Self::Vbcv => 0x20,
            Self::User => 0xF0,
            Self::Undefined(code) => code & 0xF0,
        }
    }
}

/// Baud rates addressable by the 5-bit index in serial and text headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    Baud0,
    Baud110,
    Baud150,
    Baud300,
    Baud600,
    Baud1200,
    Baud2400,
    Baud4800,
    Baud9600,
    Baud14400,
    Baud19200,
    Baud31250,
    Baud38400,
    Baud57600,
    Baud115200,
    Baud128000,
    Baud230400,
    Baud250000,
    Baud256000,
    Baud460800,
    Baud921600,
    Baud1000000,
    Baud1500000,
    Baud2000000,
    Baud3000000,
    Unknown(u8),
}

const BAUD_TABLE: &[u32] = &[
    0, 110, 150, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 31250, 38400, 57600, 115200,
    128000, 230400, 250000, 256000, 460800, 921600, 1000000, 1500000, 2000000, 3000000,
];

impl BaudRate {
    pub fn from_index(index: u8) -> Self {
        match index & 0x1F {
            0 => Self::Baud0,
            1 => Self::Baud110,
            2 => Self::Baud150,
            3 => Self::Baud300,
            4 => Self::Baud600,
            5 => Self::Baud1200,
            6 => Self::Baud2400,
            7 => Self::Baud4800,
            8 => Self::Baud9600,
            9 => Self::Baud14400,
            10 => Self::Baud19200,
            11 => Self::Baud31250,
            12 => Self::Baud38400,
            13 => Self::Baud57600,
            14 => Self::Baud115200,
            15 => Self::Baud128000,
            16 => Self::Baud230400,
            17 => Self::Baud250000,
            18 => Self::Baud256000,
            19 => Self::Baud460800,
            20 => Self::Baud921600,
            21 => Self::Baud1000000,
            22 => Self::Baud1500000,
            23 => Self::Baud2000000,
            24 => Self::Baud3000000,
            other => Self::Unknown(other),
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Baud0 => 0,
            Self::Baud110 => 1,
            Self::Baud150 => 2,
            Self::Baud300 => 3,
            Self::Baud600 => 4,
            Self::Baud1200 => 5,
            Self::Baud2400 => 6,
            Self::Baud4800 => 7,
            Self::Baud9600 => 8,
            Self::Baud14400 => 9,
            Self::Baud19200 => 10,
            Self::Baud31250 => 11,
            Self::Baud38400 => 12,
            Self::Baud57600 => 13,
            Self::Baud115200 => 14,
            Self::Baud128000 => 15,
            Self::Baud230400 => 16,
            Self::Baud250000 => 17,
            Self::Baud256000 => 18,
            Self::Baud460800 => 19,
            Self::Baud921600 => 20,
            Self::Baud1000000 => 21,
            Self::Baud1500000 => 22,
            Self::Baud2000000 => 23,
            Self::Baud3000000 => 24,
            Self::Unknown(index) => index & 0x1F,
        }
    }

    pub fn baud(self) -> Option<u32> {
        match self {
            Self::Unknown(_) => None,
            known => BAUD_TABLE.get(known.index() as usize).copied(),
        }
    }
}

/// Text stream encodings, high nibble of a text header's byte 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStreamType {
    Ascii,
    Utf8,
    Wchar,
    User,
    Undefined(u8),
}

impl TextStreamType {
    pub fn from_code(code: u8) -> Self {
        match code & 0xF0 {
            0x00 => Self::Ascii,
            0x10 => Self::Utf8,
            0x20 => Self::Wchar,
            0xF0 => Self::User,
            other => Self::Undefined(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Ascii => 0x00,
            Self::Utf8 => 0x10,
            Self::Wchar => 0x20,
            Self::User => 0xF0,
            Self::Undefined(code) => code & 0xF0,
        }
    }
}

/// Service packet kinds, byte 6 of a service header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Identification,
    ChatUtf8,
    RtPacketRegister,
    RtPacket,
    Unknown(u8),
}

impl ServiceType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Identification,
            0x01 => Self::ChatUtf8,
            0x20 => Self::RtPacketRegister,
            0x21 => Self::RtPacket,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Identification => 0x00,
            Self::ChatUtf8 => 0x01,
            Self::RtPacketRegister => 0x20,
            Self::RtPacket => 0x21,
            Self::Unknown(code) => code,
        }
    }
}

/// Decode a NUL-terminated wire string, falling back to latin-1 when the
/// bytes are not valid UTF-8. Bytes after the first NUL are ignored.
pub(crate) fn vban_text(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let trimmed = &data[..end];
    match std::str::from_utf8(trimmed) {
        Ok(text) => text.to_owned(),
        Err(err) => {
            tracing::debug!(
                "{}",
                BodyError::InvalidUtf8 {
                    pos: err.valid_up_to()
                }
            );
            trimmed.iter().map(|&b| b as char).collect()
        }
    }
}

/// A stream name as carried on the wire: 16 bytes, NUL padded.
///
/// Longer names are truncated on construction; a full 16-byte name with
/// no terminator is legal and round-trips unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamName([u8; VBAN_STREAM_NAME_SIZE]);

impl StreamName {
    pub fn new(name: &str) -> Self {
        let mut raw = [0u8; VBAN_STREAM_NAME_SIZE];
        let len = name.len().min(VBAN_STREAM_NAME_SIZE);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(raw)
    }

    pub const fn from_bytes(raw: [u8; VBAN_STREAM_NAME_SIZE]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; VBAN_STREAM_NAME_SIZE] {
        &self.0
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&vban_text(&self.0))
    }
}

impl fmt::Debug for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamName({:?})", vban_text(&self.0))
    }
}

/// Audio sub-protocol header. `samples_per_frame` and `channels` are the
/// logical counts (1-256); the wire stores count minus one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHeader {
    pub sample_rate: SampleRate,
    pub samples_per_frame: u16,
    pub channels: u16,
    pub bit_resolution: BitResolution,
    pub codec: Codec,
    pub stream_name: StreamName,
    pub frame_count: u32,
}

impl AudioHeader {
    /// Exact PCM body length this header describes
    pub fn body_len(&self) -> usize {
        self.samples_per_frame as usize * self.channels as usize * self.bit_resolution.byte_width()
    }
}

/// Serial sub-protocol header. Bodies are opaque in this crate; only the
/// baud index and raw mode bytes are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialHeader {
    pub baud: BaudRate,
    /// Raw byte 5: stop/start/parity/multipart flags
    pub flags: u8,
    pub channel: u8,
    /// Raw byte 7: data format and serial type
    pub format: u8,
    pub stream_name: StreamName,
    pub frame_count: u32,
}

/// Text sub-protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextHeader {
    pub baud: BaudRate,
    pub channel: u8,
    pub format_bit: u8,
    pub stream_type: TextStreamType,
    pub stream_name: StreamName,
    pub frame_count: u32,
}

/// Service sub-protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHeader {
    /// [`SERVICE_FUNCTION_REQUEST`] or [`SERVICE_FUNCTION_RESPONSE`]
    pub function: u8,
    pub service: ServiceType,
    pub additional_info: u8,
    pub stream_name: StreamName,
    pub frame_count: u32,
}

/// Header of an unrecognized sub-protocol flavor, preserved byte for byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueHeader {
    /// Raw byte 4 (sub-protocol and sub-protocol data)
    pub protocol_byte: u8,
    pub byte_a: u8,
    pub byte_b: u8,
    pub byte_c: u8,
    pub stream_name: StreamName,
    pub frame_count: u32,
}

/// A decoded 28-byte VBAN header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Audio(AudioHeader),
    Serial(SerialHeader),
    Text(TextHeader),
    Service(ServiceHeader),
    Opaque(OpaqueHeader),
}

impl Header {
    pub fn sub_protocol(&self) -> SubProtocol {
        match self {
            Self::Audio(_) => SubProtocol::Audio,
            Self::Serial(_) => SubProtocol::Serial,
            Self::Text(_) => SubProtocol::Text,
            Self::Service(_) => SubProtocol::Service,
            Self::Opaque(h) => SubProtocol::from_byte(h.protocol_byte),
        }
    }

    pub fn stream_name(&self) -> &StreamName {
        match self {
            Self::Audio(h) => &h.stream_name,
            Self::Serial(h) => &h.stream_name,
            Self::Text(h) => &h.stream_name,
            Self::Service(h) => &h.stream_name,
            Self::Opaque(h) => &h.stream_name,
        }
    }

    pub fn frame_count(&self) -> u32 {
        match self {
            Self::Audio(h) => h.frame_count,
            Self::Serial(h) => h.frame_count,
            Self::Text(h) => h.frame_count,
            Self::Service(h) => h.frame_count,
            Self::Opaque(h) => h.frame_count,
        }
    }

    pub fn set_frame_count(&mut self, frame_count: u32) {
        match self {
            Self::Audio(h) => h.frame_count = frame_count,
            Self::Serial(h) => h.frame_count = frame_count,
            Self::Text(h) => h.frame_count = frame_count,
            Self::Service(h) => h.frame_count = frame_count,
            Self::Opaque(h) => h.frame_count = frame_count,
        }
    }

    /// Encode to the fixed 28-byte wire layout
    pub fn encode(&self) -> [u8; VBAN_HEADER_SIZE] {
        let (protocol_byte, byte_a, byte_b, byte_c) = match self {
            Self::Audio(h) => (
                SubProtocol::Audio.as_byte() | h.sample_rate.index(),
                h.samples_per_frame.saturating_sub(1) as u8,
                h.channels.saturating_sub(1) as u8,
                h.bit_resolution.code() | h.codec.code(),
            ),
            Self::Serial(h) => (
                SubProtocol::Serial.as_byte() | h.baud.index(),
                h.flags,
                h.channel,
                h.format,
            ),
            Self::Text(h) => (
                SubProtocol::Text.as_byte() | h.baud.index(),
                0,
                h.channel,
                (h.format_bit & 0x07) | h.stream_type.code(),
            ),
            Self::Service(h) => (
                SubProtocol::Service.as_byte(),
                h.function,
                h.service.code(),
                h.additional_info,
            ),
            Self::Opaque(h) => (h.protocol_byte, h.byte_a, h.byte_b, h.byte_c),
        };

        let mut buf = [0u8; VBAN_HEADER_SIZE];
        buf[0..4].copy_from_slice(VBAN_MAGIC);
        buf[4] = protocol_byte;
        buf[5] = byte_a;
        buf[6] = byte_b;
        buf[7] = byte_c;
        buf[8..24].copy_from_slice(self.stream_name().as_bytes());
        buf[24..28].copy_from_slice(&self.frame_count().to_le_bytes());
        buf
    }

    /// Decode the first 28 bytes of a datagram
    pub fn decode(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < VBAN_HEADER_SIZE {
            return Err(HeaderError::TooShort(data.len()));
        }
        if &data[0..4] != VBAN_MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let protocol_byte = data[4];
        let (byte_a, byte_b, byte_c) = (data[5], data[6], data[7]);
        let mut raw_name = [0u8; VBAN_STREAM_NAME_SIZE];
        raw_name.copy_from_slice(&data[8..24]);
        let stream_name = StreamName::from_bytes(raw_name);
        let frame_count = u32::from_le_bytes(
            data[24..28]
                .try_into()
                .map_err(|_| HeaderError::FramecountDecode)?,
        );

        Ok(match SubProtocol::from_byte(protocol_byte) {
            SubProtocol::Audio => Self::Audio(AudioHeader {
                sample_rate: SampleRate::from_index(protocol_byte),
                samples_per_frame: byte_a as u16 + 1,
                channels: byte_b as u16 + 1,
                bit_resolution: BitResolution::from_code(byte_c),
                codec: Codec::from_code(byte_c),
                stream_name,
                frame_count,
            }),
            SubProtocol::Serial => Self::Serial(SerialHeader {
                baud: BaudRate::from_index(protocol_byte),
                flags: byte_a,
                channel: byte_b,
                format: byte_c,
                stream_name,
                frame_count,
            }),
            SubProtocol::Text => Self::Text(TextHeader {
                baud: BaudRate::from_index(protocol_byte),
                channel: byte_b,
                format_bit: byte_c & 0x07,
                stream_type: TextStreamType::from_code(byte_c),
                stream_name,
                frame_count,
            }),
            SubProtocol::Service => Self::Service(ServiceHeader {
                function: byte_a,
                service: ServiceType::from_code(byte_b),
                additional_info: byte_c,
                stream_name,
                frame_count,
            }),
            _ => Self::Opaque(OpaqueHeader {
                protocol_byte,
                byte_a,
                byte_b,
                byte_c,
                stream_name,
                frame_count,
            }),
        })
    }
}

/// A decoded packet body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Raw PCM frames of an audio packet
    Pcm(Bytes),
    /// UTF-8 text (text streams and chat payloads)
    Text(String),
    /// Identification ping payload
    Ping(Box<Ping>),
    /// Voicemeeter real-time state snapshot
    Rt(Box<RtPacket>),
    /// Anything this crate does not interpret
    Raw(Bytes),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Self::Pcm(data) | Self::Raw(data) => data.len(),
            Self::Text(text) => text.len(),
            Self::Ping(_) => crate::service::PING_BODY_SIZE,
            Self::Rt(_) => crate::service::RT_PACKET_BODY_SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A full VBAN packet: typed header plus typed body
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Body,
}

impl Packet {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    /// Decode a datagram into a typed packet.
    ///
    /// Service bodies are interpreted by service type: identification
    /// payloads become [`Body::Ping`] (short bodies are NUL-padded to the
    /// full 676 bytes first), RT packets with a request function become
    /// [`Body::Rt`], UTF-8 chat becomes [`Body::Text`]. Everything else
    /// is preserved as raw bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(data)?;
        let payload = &data[VBAN_HEADER_SIZE..];

        let body = match &header {
            Header::Audio(_) => Body::Pcm(Bytes::copy_from_slice(payload)),
            Header::Text(_) => Body::Text(vban_text(payload)),
            Header::Service(service) => match (service.service, service.function) {
                (ServiceType::Identification, _) => Body::Ping(Box::new(Ping::decode(payload))),
                (ServiceType::RtPacket, SERVICE_FUNCTION_REQUEST) => {
                    Body::Rt(Box::new(RtPacket::decode(payload)?))
                }
                (ServiceType::ChatUtf8, _) => Body::Text(vban_text(payload)),
                _ => Body::Raw(Bytes::copy_from_slice(payload)),
            },
            _ => Body::Raw(Bytes::copy_from_slice(payload)),
        };

        Ok(Self { header, body })
    }

    /// Encode header and body into a datagram.
    ///
    /// Audio packets are validated: the frame and channel counts must fit
    /// the wire encoding and the body must be exactly
    /// `samples * channels * byte_width` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if let Header::Audio(audio) = &self.header {
            if audio.samples_per_frame == 0 || audio.samples_per_frame > 256 {
                return Err(PacketError::InvalidPacket(format!(
                    "samples_per_frame {} outside 1-256",
                    audio.samples_per_frame
                )));
            }
            if audio.channels == 0 || audio.channels > 256 {
                return Err(PacketError::InvalidPacket(format!(
                    "channels {} outside 1-256",
                    audio.channels
                )));
            }
            let got = match &self.body {
                Body::Pcm(data) | Body::Raw(data) => data.len(),
                _ => {
                    return Err(PacketError::InvalidPacket(
                        "audio packet requires a PCM body".into(),
                    ))
                }
            };
            let expected = audio.body_len();
            if got != expected {
                return Err(PacketError::InvalidPacket(format!(
                    "audio body is {got} bytes, header describes {expected}"
                )));
            }
        }
        if let Header::Service(service) = &self.header {
            match (service.service, &self.body) {
                (ServiceType::Identification, Body::Rt(_))
                | (ServiceType::RtPacket, Body::Ping(_)) => {
                    return Err(PacketError::Body(BodyError::BadField("service")));
                }
                _ => {}
            }
        }

        let mut out = Vec::with_capacity(VBAN_HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.encode());
        match &self.body {
            Body::Pcm(data) | Body::Raw(data) => out.extend_from_slice(data),
            Body::Text(text) => out.extend_from_slice(text.as_bytes()),
            Body::Ping(ping) => out.extend_from_slice(&ping.encode()),
            Body::Rt(rt) => out.extend_from_slice(&rt.encode()),
        }
        Ok(out)
    }
}
