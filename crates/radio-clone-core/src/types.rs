//! Shared data model: device identity, blocks, images and channel rows.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CloneError;

/// Composite identity (family + class) scoping a cached image to one device profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    family: String,
    class: String,
}

impl DeviceKey {
    /// Create a key from its two parts.
    #[must_use]
    pub fn new(family: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            class: class.into(),
        }
    }

    /// Device family (driver module) name.
    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Device class (model) name within the family.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.family, self.class)
    }
}

impl FromStr for DeviceKey {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((family, class)) if !family.is_empty() && !class.is_empty() => {
                Ok(Self::new(family, class))
            }
            _ => Err(CloneError::UnknownDevice(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = CloneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.to_string()
    }
}

/// Address/length pair of one block in a transfer plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSpan {
    pub address: u16,
    pub length: u8,
}

impl BlockSpan {
    /// First address past this span.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.address as u32 + self.length as u32
    }

    /// The three header bytes that follow the command byte: be16 address, u8 length.
    #[must_use]
    pub const fn header(&self) -> [u8; 3] {
        let [hi, lo] = self.address.to_be_bytes();
        [hi, lo, self.length]
    }
}

/// Full binary memory image of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneImage {
    key: DeviceKey,
    bytes: Vec<u8>,
}

impl CloneImage {
    /// Wrap `bytes` as the image for `key`.
    ///
    /// # Errors
    /// Returns `InvalidImage` if the byte count differs from `declared_size`.
    pub fn new(key: DeviceKey, bytes: Vec<u8>, declared_size: usize) -> Result<Self, CloneError> {
        if bytes.len() != declared_size {
            return Err(CloneError::InvalidImage(format!(
                "{key}: image is {} bytes, device declares {declared_size}",
                bytes.len()
            )));
        }
        Ok(Self { key, bytes })
    }

    #[must_use]
    pub const fn key(&self) -> &DeviceKey {
        &self.key
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Result of a buffered read: whatever arrived, and whether the deadline hit first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    pub timed_out: bool,
}

/// Description of an open serial session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub baud_rate: u32,
}

/// Requested modem control line levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLines {
    pub dtr: bool,
    pub rts: bool,
}

impl Default for ControlLines {
    fn default() -> Self {
        Self { dtr: true, rts: true }
    }
}

/// Transmit offset direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Duplex {
    #[default]
    #[serde(rename = "")]
    Simplex,
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Minus,
    /// `offset` holds the absolute transmit frequency.
    #[serde(rename = "split")]
    Split,
    /// Transmit inhibited.
    #[serde(rename = "off")]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ToneMode {
    #[default]
    #[serde(rename = "")]
    None,
    Tone,
    #[serde(rename = "TSQL")]
    Tsql,
    #[serde(rename = "DTCS")]
    Dtcs,
    Cross,
}

/// Transmit/receive squelch pairing used when `tone_mode` is `Cross`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrossMode {
    #[default]
    #[serde(rename = "Tone->Tone")]
    ToneTone,
    #[serde(rename = "Tone->DTCS")]
    ToneDtcs,
    #[serde(rename = "DTCS->Tone")]
    DtcsTone,
    #[serde(rename = "DTCS->DTCS")]
    DtcsDtcs,
    #[serde(rename = "->Tone")]
    NoneTone,
    #[serde(rename = "->DTCS")]
    NoneDtcs,
    #[serde(rename = "DTCS->")]
    DtcsNone,
}

/// DTCS polarity, transmit then receive (`N`ormal / `R`eversed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DtcsPolarity {
    #[default]
    #[serde(rename = "NN")]
    Nn,
    #[serde(rename = "NR")]
    Nr,
    #[serde(rename = "RN")]
    Rn,
    #[serde(rename = "RR")]
    Rr,
}

impl DtcsPolarity {
    /// Build from (tx reversed, rx reversed).
    #[must_use]
    pub const fn from_flags(tx_reversed: bool, rx_reversed: bool) -> Self {
        match (tx_reversed, rx_reversed) {
            (false, false) => Self::Nn,
            (false, true) => Self::Nr,
            (true, false) => Self::Rn,
            (true, true) => Self::Rr,
        }
    }

    #[must_use]
    pub const fn tx_reversed(self) -> bool {
        matches!(self, Self::Rn | Self::Rr)
    }

    #[must_use]
    pub const fn rx_reversed(self) -> bool {
        matches!(self, Self::Nr | Self::Rr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "FM")]
    Fm,
    #[serde(rename = "NFM")]
    Nfm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerLevel {
    #[default]
    High,
    Low,
}

/// One channel of the device's memory, in editable form.
///
/// Frequencies are in Hz, tones in tenths of Hz (88.5 Hz is `885`), DTCS
/// codes as their usual three-digit decimal spelling (`023` is `23`).
/// A `frequency` of zero marks an empty channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRow {
    pub location: u32,
    pub name: String,
    pub frequency: u64,
    pub duplex: Duplex,
    pub offset: u64,
    pub tone_mode: ToneMode,
    pub r_tone: u16,
    pub c_tone: u16,
    pub dtcs_code: u16,
    pub rx_dtcs_code: u16,
    pub dtcs_polarity: DtcsPolarity,
    pub cross_mode: CrossMode,
    pub mode: Mode,
    pub power: PowerLevel,
    pub skip: bool,
    pub comment: String,
}

impl Default for MemoryRow {
    fn default() -> Self {
        Self {
            location: 0,
            name: String::new(),
            frequency: 0,
            duplex: Duplex::Simplex,
            offset: 0,
            tone_mode: ToneMode::None,
            r_tone: 885,
            c_tone: 885,
            dtcs_code: 23,
            rx_dtcs_code: 23,
            dtcs_polarity: DtcsPolarity::Nn,
            cross_mode: CrossMode::ToneTone,
            mode: Mode::Fm,
            power: PowerLevel::High,
            skip: false,
            comment: String::new(),
        }
    }
}

impl MemoryRow {
    /// A simplex FM channel at `frequency` Hz.
    #[must_use]
    pub fn new(location: u32, frequency: u64) -> Self {
        Self {
            location,
            frequency,
            ..Self::default()
        }
    }

    /// An erase request for `location`.
    #[must_use]
    pub fn empty(location: u32) -> Self {
        Self::new(location, 0)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frequency == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn test_device_key_roundtrip() {
        let key: DeviceKey = "p3107.CompactHandheld".parse().unwrap();
        assert_eq!(key.family(), "p3107");
        assert_eq!(key.class(), "CompactHandheld");
        assert_eq!(key.to_string(), "p3107.CompactHandheld");

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"p3107.CompactHandheld\"");
    }

    #[test]
    fn test_device_key_rejects_missing_class() {
        assert_err!("p3107".parse::<DeviceKey>());
        assert_err!(".x".parse::<DeviceKey>());
    }

    #[test]
    fn test_image_size_must_match_declaration() {
        let key = DeviceKey::new("p3107", "CompactHandheld");
        assert_ok!(CloneImage::new(key.clone(), vec![0; 128], 128));
        let err = CloneImage::new(key, vec![0; 120], 128).unwrap_err();
        assert!(matches!(err, CloneError::InvalidImage(_)));
    }

    #[test]
    fn test_block_span_header_is_big_endian() {
        let span = BlockSpan {
            address: 0x0120,
            length: 8,
        };
        assert_eq!(span.header(), [0x01, 0x20, 0x08]);
        assert_eq!(span.end(), 0x0128);
    }

    #[test]
    fn test_row_serialization_uses_short_names() {
        let row = MemoryRow {
            duplex: Duplex::Minus,
            tone_mode: ToneMode::Tsql,
            mode: Mode::Nfm,
            ..MemoryRow::new(3, 146_520_000)
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["duplex"], "-");
        assert_eq!(json["tone_mode"], "TSQL");
        assert_eq!(json["mode"], "NFM");

        let parsed: MemoryRow = serde_json::from_str(r#"{"location": 2, "frequency": 446000000}"#).unwrap();
        assert_eq!(parsed.location, 2);
        assert_eq!(parsed.r_tone, 885);
        assert_eq!(parsed.mode, Mode::Fm);
    }
}
