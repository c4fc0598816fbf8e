//! Channel record encoding for the block memory map.
//!
//! Each record is 16 bytes:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | rx frequency, little-endian BCD, 10 Hz units |
//! | 4 | 4 | tx frequency, same encoding; all `0xFF` = transmit off |
//! | 8 | 2 | rx tone (squelch) |
//! | 10 | 2 | tx tone (encode) |
//! | 12 | 1 | flags |
//! | 13 | 3 | reserved, preserved verbatim |
//!
//! Tones are little-endian BCD in tenths of Hz. In the high byte `0x80`
//! marks a DTCS code and `0x40` reversed polarity; `0xFFFF` is no tone.

use std::ops::Range;

use radio_clone_core::{CrossMode, DtcsPolarity, Duplex, MemoryRow, Mode, PowerLevel, ToneMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RECORD_SIZE: usize = 16;

const FLAG_SKIP: u8 = 0x10;
const FLAG_HIGH_POWER: u8 = 0x08;
const FLAG_NARROW: u8 = 0x04;

const TONE_DTCS: u8 = 0x80;
const TONE_REVERSED: u8 = 0x40;

/// Transmit offsets beyond this are shown as split frequencies.
const SPLIT_THRESHOLD_HZ: u64 = 70_000_000;

/// Largest frequency four BCD bytes can hold.
const MAX_FREQUENCY_HZ: u64 = 999_999_990;

const TONE_RANGE: std::ops::RangeInclusive<u16> = 600..=2541;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("location {location} outside 1..={count}")]
    Location { location: u32, count: u32 },
    #[error("frequency {0} Hz is not a multiple of 10 Hz within range")]
    Frequency(u64),
    #[error("transmit frequency for offset {offset} Hz is out of range")]
    Offset { offset: u64 },
    #[error("tone {0} is not a valid CTCSS tone (tenths of Hz)")]
    Tone(u16),
    #[error("DTCS code {0:03} is not a valid code")]
    Dtcs(u16),
}

/// Where the channel directory sits in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// Address of the record for location 1.
    pub base: u16,
    /// Number of records; locations are `1..=count`.
    pub count: u32,
}

impl ChannelLayout {
    /// Byte range of the whole directory.
    #[must_use]
    pub const fn directory(&self) -> Range<usize> {
        let start = self.base as usize;
        start..start + self.count as usize * RECORD_SIZE
    }

    /// Byte range of the record for `location`.
    ///
    /// # Errors
    /// Returns `LayoutError::Location` when `location` is outside `1..=count`.
    pub const fn record(&self, location: u32) -> Result<Range<usize>, LayoutError> {
        if location == 0 || location > self.count {
            return Err(LayoutError::Location {
                location,
                count: self.count,
            });
        }
        let start = self.base as usize + (location as usize - 1) * RECORD_SIZE;
        Ok(start..start + RECORD_SIZE)
    }

    /// Decode every slot in `image`, empty ones included.
    #[must_use]
    pub fn decode_all(&self, image: &[u8]) -> Vec<MemoryRow> {
        (1..=self.count)
            .map(|location| {
                self.record(location)
                    .ok()
                    .and_then(|range| image.get(range))
                    .map_or_else(|| MemoryRow::empty(location), |record| decode(location, record))
            })
            .collect()
    }
}

/// Decode one record.
#[must_use]
pub fn decode(location: u32, record: &[u8]) -> MemoryRow {
    if record.len() < RECORD_SIZE || record[..4].iter().all(|&b| b == 0xFF) {
        return MemoryRow::empty(location);
    }

    let rx = bcd_to_u64(&record[..4]) * 10;
    let mut row = MemoryRow::new(location, rx);

    if record[4..8].iter().all(|&b| b == 0xFF) {
        row.duplex = Duplex::Off;
    } else {
        let tx = bcd_to_u64(&record[4..8]) * 10;
        if tx == rx {
            row.duplex = Duplex::Simplex;
        } else if tx.abs_diff(rx) > SPLIT_THRESHOLD_HZ {
            row.duplex = Duplex::Split;
            row.offset = tx;
        } else if tx > rx {
            row.duplex = Duplex::Plus;
            row.offset = tx - rx;
        } else {
            row.duplex = Duplex::Minus;
            row.offset = rx - tx;
        }
    }

    let rx_tone = Squelch::decode([record[8], record[9]]);
    let tx_tone = Squelch::decode([record[10], record[11]]);
    apply_squelch(&mut row, tx_tone, rx_tone);

    let flags = record[12];
    row.skip = flags & FLAG_SKIP != 0;
    row.power = if flags & FLAG_HIGH_POWER == 0 {
        PowerLevel::Low
    } else {
        PowerLevel::High
    };
    row.mode = if flags & FLAG_NARROW == 0 { Mode::Fm } else { Mode::Nfm };
    row
}

/// Encode `row` into `record`, keeping the reserved bytes.
///
/// An empty row erases the slot.
///
/// # Errors
/// Returns a `LayoutError` when a value cannot be represented.
pub fn encode(row: &MemoryRow, record: &mut [u8]) -> Result<(), LayoutError> {
    let record = &mut record[..RECORD_SIZE];
    if row.is_empty() {
        record[..13].fill(0xFF);
        return Ok(());
    }

    let encoded = encode_fields(row)?;
    record[..13].copy_from_slice(&encoded);
    Ok(())
}

/// Check that `row` can be encoded without touching any image.
///
/// # Errors
/// Returns the first `LayoutError` found.
pub fn validate(row: &MemoryRow) -> Result<(), LayoutError> {
    if row.is_empty() {
        return Ok(());
    }
    encode_fields(row).map(|_| ())
}

fn encode_fields(row: &MemoryRow) -> Result<[u8; 13], LayoutError> {
    let mut out = [0u8; 13];
    out[..4].copy_from_slice(&frequency_bcd(row.frequency)?);

    let tx = match row.duplex {
        Duplex::Simplex => Some(row.frequency),
        Duplex::Plus => Some(
            row.frequency
                .checked_add(row.offset)
                .ok_or(LayoutError::Offset { offset: row.offset })?,
        ),
        Duplex::Minus => Some(
            row.frequency
                .checked_sub(row.offset)
                .ok_or(LayoutError::Offset { offset: row.offset })?,
        ),
        Duplex::Split => Some(row.offset),
        Duplex::Off => None,
    };
    match tx {
        Some(tx) => {
            let bcd = frequency_bcd(tx).map_err(|_| LayoutError::Offset { offset: row.offset })?;
            out[4..8].copy_from_slice(&bcd);
        }
        None => out[4..8].fill(0xFF),
    }

    let (tx_tone, rx_tone) = squelch_pair(row);
    out[8..10].copy_from_slice(&rx_tone.encode()?);
    out[10..12].copy_from_slice(&tx_tone.encode()?);

    let mut flags = 0;
    if row.skip {
        flags |= FLAG_SKIP;
    }
    if row.power == PowerLevel::High {
        flags |= FLAG_HIGH_POWER;
    }
    if row.mode == Mode::Nfm {
        flags |= FLAG_NARROW;
    }
    out[12] = flags;
    Ok(out)
}

/// One direction of squelch signalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Squelch {
    None,
    Tone(u16),
    Dtcs { code: u16, reversed: bool },
}

impl Squelch {
    fn decode(bytes: [u8; 2]) -> Self {
        if bytes == [0xFF, 0xFF] {
            return Self::None;
        }
        let [lo, hi] = bytes;
        let digits = bcd_to_u64(&[lo, hi & 0x3F]);
        #[allow(clippy::cast_possible_truncation)]
        let value = digits as u16;
        if hi & TONE_DTCS == 0 {
            Self::Tone(value)
        } else {
            Self::Dtcs {
                code: value,
                reversed: hi & TONE_REVERSED != 0,
            }
        }
    }

    fn encode(self) -> Result<[u8; 2], LayoutError> {
        match self {
            Self::None => Ok([0xFF, 0xFF]),
            Self::Tone(tone) => {
                if !TONE_RANGE.contains(&tone) {
                    return Err(LayoutError::Tone(tone));
                }
                Ok(tone_bcd(tone))
            }
            Self::Dtcs { code, reversed } => {
                if !is_dtcs_code(code) {
                    return Err(LayoutError::Dtcs(code));
                }
                let [lo, hi] = tone_bcd(code);
                let polarity = if reversed { TONE_REVERSED } else { 0 };
                Ok([lo, hi | TONE_DTCS | polarity])
            }
        }
    }
}

/// Transmit and receive squelch implied by a row.
fn squelch_pair(row: &MemoryRow) -> (Squelch, Squelch) {
    let tx_rev = row.dtcs_polarity.tx_reversed();
    let rx_rev = row.dtcs_polarity.rx_reversed();
    let tx_dtcs = Squelch::Dtcs {
        code: row.dtcs_code,
        reversed: tx_rev,
    };
    match row.tone_mode {
        ToneMode::None => (Squelch::None, Squelch::None),
        ToneMode::Tone => (Squelch::Tone(row.r_tone), Squelch::None),
        ToneMode::Tsql => (Squelch::Tone(row.c_tone), Squelch::Tone(row.c_tone)),
        ToneMode::Dtcs => (
            tx_dtcs,
            Squelch::Dtcs {
                code: row.dtcs_code,
                reversed: rx_rev,
            },
        ),
        ToneMode::Cross => {
            let rx_dtcs = Squelch::Dtcs {
                code: row.rx_dtcs_code,
                reversed: rx_rev,
            };
            match row.cross_mode {
                CrossMode::ToneTone => (Squelch::Tone(row.r_tone), Squelch::Tone(row.c_tone)),
                CrossMode::ToneDtcs => (Squelch::Tone(row.r_tone), rx_dtcs),
                CrossMode::DtcsTone => (tx_dtcs, Squelch::Tone(row.c_tone)),
                CrossMode::DtcsDtcs => (tx_dtcs, rx_dtcs),
                CrossMode::NoneTone => (Squelch::None, Squelch::Tone(row.c_tone)),
                CrossMode::NoneDtcs => (Squelch::None, rx_dtcs),
                CrossMode::DtcsNone => (tx_dtcs, Squelch::None),
            }
        }
    }
}

fn apply_squelch(row: &mut MemoryRow, tx: Squelch, rx: Squelch) {
    let mut tx_rev = false;
    let mut rx_rev = false;
    match (tx, rx) {
        (Squelch::None, Squelch::None) => row.tone_mode = ToneMode::None,
        (Squelch::Tone(t), Squelch::None) => {
            row.tone_mode = ToneMode::Tone;
            row.r_tone = t;
        }
        (Squelch::Tone(t), Squelch::Tone(r)) if t == r => {
            row.tone_mode = ToneMode::Tsql;
            row.c_tone = t;
        }
        (
            Squelch::Dtcs { code, reversed },
            Squelch::Dtcs {
                code: rx_code,
                reversed: rx_reversed,
            },
        ) if code == rx_code => {
            row.tone_mode = ToneMode::Dtcs;
            row.dtcs_code = code;
            row.rx_dtcs_code = code;
            tx_rev = reversed;
            rx_rev = rx_reversed;
        }
        (tx, rx) => {
            row.tone_mode = ToneMode::Cross;
            row.cross_mode = match (tx, rx) {
                (Squelch::Tone(_), Squelch::Tone(_)) => CrossMode::ToneTone,
                (Squelch::Tone(_), Squelch::Dtcs { .. }) => CrossMode::ToneDtcs,
                (Squelch::Dtcs { .. }, Squelch::Tone(_)) => CrossMode::DtcsTone,
                (Squelch::Dtcs { .. }, Squelch::Dtcs { .. }) => CrossMode::DtcsDtcs,
                (Squelch::None, Squelch::Tone(_)) => CrossMode::NoneTone,
                (Squelch::None, Squelch::Dtcs { .. }) => CrossMode::NoneDtcs,
                (Squelch::Dtcs { .. }, Squelch::None) => CrossMode::DtcsNone,
                (_, Squelch::None) => unreachable!("handled by the simple modes"),
            };
            match tx {
                Squelch::Tone(t) => row.r_tone = t,
                Squelch::Dtcs { code, reversed } => {
                    row.dtcs_code = code;
                    tx_rev = reversed;
                }
                Squelch::None => {}
            }
            match rx {
                Squelch::Tone(r) => row.c_tone = r,
                Squelch::Dtcs { code, reversed } => {
                    row.rx_dtcs_code = code;
                    rx_rev = reversed;
                }
                Squelch::None => {}
            }
        }
    }
    row.dtcs_polarity = DtcsPolarity::from_flags(tx_rev, rx_rev);
}

/// DTCS codes are three octal digits.
const fn is_dtcs_code(code: u16) -> bool {
    code <= 777 && code % 10 <= 7 && (code / 10) % 10 <= 7
}

fn frequency_bcd(hz: u64) -> Result<[u8; 4], LayoutError> {
    if hz == 0 || hz > MAX_FREQUENCY_HZ || hz % 10 != 0 {
        return Err(LayoutError::Frequency(hz));
    }
    let mut out = [0u8; 4];
    u64_to_bcd(hz / 10, &mut out);
    Ok(out)
}

fn tone_bcd(value: u16) -> [u8; 2] {
    let mut out = [0u8; 2];
    u64_to_bcd(u64::from(value), &mut out);
    out
}

/// Little-endian packed BCD: least significant digit pair first.
#[must_use]
pub fn bcd_to_u64(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, &b| {
        acc * 100 + u64::from(b >> 4) * 10 + u64::from(b & 0x0F)
    })
}

/// Write `value` as little-endian packed BCD, filling all of `out`.
pub fn u64_to_bcd(mut value: u64, out: &mut [u8]) {
    for byte in out.iter_mut() {
        #[allow(clippy::cast_possible_truncation)]
        let pair = (value % 100) as u8;
        *byte = ((pair / 10) << 4) | (pair % 10);
        value /= 100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ChannelLayout = ChannelLayout {
        base: 0x0010,
        count: 6,
    };

    fn roundtrip(row: &MemoryRow) -> MemoryRow {
        let mut record = [0xFF; RECORD_SIZE];
        encode(row, &mut record).unwrap();
        decode(row.location, &record)
    }

    #[test]
    fn test_bcd_little_endian() {
        let mut out = [0u8; 4];
        u64_to_bcd(14_652_000, &mut out);
        assert_eq!(out, [0x00, 0x20, 0x65, 0x14]);
        assert_eq!(bcd_to_u64(&out), 14_652_000);
    }

    #[test]
    fn test_record_ranges() {
        assert_eq!(LAYOUT.record(1).unwrap(), 0x10..0x20);
        assert_eq!(LAYOUT.record(6).unwrap(), 0x60..0x70);
        assert_eq!(LAYOUT.directory(), 0x10..0x70);
        assert_eq!(
            LAYOUT.record(7),
            Err(LayoutError::Location {
                location: 7,
                count: 6
            })
        );
        assert!(LAYOUT.record(0).is_err());
    }

    #[test]
    fn test_simplex_record_bytes() {
        let row = MemoryRow::new(1, 146_520_000);
        let mut record = [0xAA; RECORD_SIZE];
        encode(&row, &mut record).unwrap();
        assert_eq!(&record[..4], &[0x00, 0x20, 0x65, 0x14]);
        assert_eq!(record[4..8], record[..4]);
        assert_eq!(&record[8..12], &[0xFF; 4]);
        assert_eq!(record[12], FLAG_HIGH_POWER);
        assert_eq!(&record[13..], &[0xAA; 3]);
    }

    #[test]
    fn test_repeater_offsets() {
        let minus = MemoryRow {
            duplex: Duplex::Minus,
            offset: 600_000,
            tone_mode: ToneMode::Tone,
            r_tone: 1000,
            ..MemoryRow::new(2, 146_940_000)
        };
        assert_eq!(roundtrip(&minus), minus);

        let split = MemoryRow {
            duplex: Duplex::Split,
            offset: 446_000_000,
            ..MemoryRow::new(3, 146_000_000)
        };
        assert_eq!(roundtrip(&split), split);

        let off = MemoryRow {
            duplex: Duplex::Off,
            ..MemoryRow::new(4, 162_550_000)
        };
        assert_eq!(roundtrip(&off), off);
    }

    #[test]
    fn test_squelch_modes() {
        let tsql = MemoryRow {
            tone_mode: ToneMode::Tsql,
            c_tone: 1318,
            ..MemoryRow::new(1, 446_006_250)
        };
        assert_eq!(roundtrip(&tsql), tsql);

        let dtcs = MemoryRow {
            tone_mode: ToneMode::Dtcs,
            dtcs_code: 754,
            rx_dtcs_code: 754,
            dtcs_polarity: DtcsPolarity::Rn,
            ..MemoryRow::new(1, 462_562_500)
        };
        assert_eq!(roundtrip(&dtcs), dtcs);

        let cross = MemoryRow {
            tone_mode: ToneMode::Cross,
            cross_mode: CrossMode::ToneDtcs,
            r_tone: 1000,
            rx_dtcs_code: 23,
            dtcs_polarity: DtcsPolarity::Nr,
            ..MemoryRow::new(1, 145_500_000)
        };
        assert_eq!(roundtrip(&cross), cross);
    }

    #[test]
    fn test_dtcs_flag_bits() {
        let row = MemoryRow {
            tone_mode: ToneMode::Dtcs,
            dtcs_code: 23,
            dtcs_polarity: DtcsPolarity::Nr,
            ..MemoryRow::new(1, 145_500_000)
        };
        let mut record = [0xFF; RECORD_SIZE];
        encode(&row, &mut record).unwrap();
        assert_eq!(&record[8..10], &[0x23, 0x80 | 0x40]);
        assert_eq!(&record[10..12], &[0x23, 0x80]);
    }

    #[test]
    fn test_flags() {
        let row = MemoryRow {
            mode: Mode::Nfm,
            power: PowerLevel::Low,
            skip: true,
            ..MemoryRow::new(5, 446_100_000)
        };
        let mut record = [0xFF; RECORD_SIZE];
        encode(&row, &mut record).unwrap();
        assert_eq!(record[12], FLAG_SKIP | FLAG_NARROW);
        assert_eq!(roundtrip(&row), row);
    }

    #[test]
    fn test_empty_row_erases_but_keeps_reserved() {
        let mut record = [0x11; RECORD_SIZE];
        encode(&MemoryRow::empty(2), &mut record).unwrap();
        assert_eq!(&record[..13], &[0xFF; 13]);
        assert_eq!(&record[13..], &[0x11; 3]);
        assert!(decode(2, &record).is_empty());
    }

    #[test]
    fn test_rejects_unencodable_values() {
        assert_eq!(
            validate(&MemoryRow::new(1, 146_520_005)),
            Err(LayoutError::Frequency(146_520_005))
        );
        let bad_tone = MemoryRow {
            tone_mode: ToneMode::Tone,
            r_tone: 50,
            ..MemoryRow::new(1, 146_520_000)
        };
        assert_eq!(validate(&bad_tone), Err(LayoutError::Tone(50)));
        let bad_code = MemoryRow {
            tone_mode: ToneMode::Dtcs,
            dtcs_code: 89,
            ..MemoryRow::new(1, 146_520_000)
        };
        assert_eq!(validate(&bad_code), Err(LayoutError::Dtcs(89)));
        let underflow = MemoryRow {
            duplex: Duplex::Minus,
            offset: 200_000_000,
            ..MemoryRow::new(1, 146_520_000)
        };
        assert!(matches!(validate(&underflow), Err(LayoutError::Offset { .. })));
    }

    #[test]
    fn test_rejects_overflowing_plus_offset() {
        let overflow = MemoryRow {
            duplex: Duplex::Plus,
            offset: u64::MAX,
            ..MemoryRow::new(1, 146_520_000)
        };
        assert_eq!(
            validate(&overflow),
            Err(LayoutError::Offset { offset: u64::MAX })
        );
        let mut record = [0xFF; RECORD_SIZE];
        assert!(encode(&overflow, &mut record).is_err());
        assert_eq!(record, [0xFF; RECORD_SIZE]);
    }

    #[test]
    fn test_decode_all_reports_empty_slots() {
        let mut image = vec![0xFF; 128];
        let row = MemoryRow::new(3, 146_520_000);
        encode(&row, &mut image[LAYOUT.record(3).unwrap()]).unwrap();
        let rows = LAYOUT.decode_all(&image);
        assert_eq!(rows.len(), 6);
        assert!(rows[0].is_empty());
        assert_eq!(rows[2], row);
    }
}
