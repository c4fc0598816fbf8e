//! Mapping between cached images and editable channel rows.

use std::collections::{HashMap, HashSet};

use radio_clone_core::{CloneError, CloneImage, MemoryRow};
use radio_clone_engine::{DeviceFamily, layout};

/// Populated channels in `image`, ordered by location.
#[must_use]
pub fn decode_rows(family: &DeviceFamily, image: &CloneImage) -> Vec<MemoryRow> {
    family
        .layout
        .decode_all(image.bytes())
        .into_iter()
        .filter(|row| !row.is_empty())
        .collect()
}

/// Check every row before anything touches the radio.
///
/// # Errors
/// `InvalidRow` for a duplicate or out-of-range location, or a value the
/// channel record cannot hold.
pub fn validate_rows(family: &DeviceFamily, rows: &[MemoryRow]) -> Result<(), CloneError> {
    let mut seen = HashSet::new();
    for row in rows {
        family
            .layout
            .record(row.location)
            .map_err(|e| CloneError::InvalidRow(e.to_string()))?;
        if !seen.insert(row.location) {
            return Err(CloneError::InvalidRow(format!(
                "location {} appears more than once",
                row.location
            )));
        }
        layout::validate(row)
            .map_err(|e| CloneError::InvalidRow(format!("location {}: {e}", row.location)))?;
    }
    Ok(())
}

/// Apply `rows`, the complete channel table, to a copy of `image`.
///
/// A named slot is rewritten only when the row differs from what the slot
/// already decodes to; a row with frequency 0 erases it. Every slot no row
/// names is erased. Reserved record bytes and everything outside the
/// channel directory are carried over verbatim.
///
/// # Errors
/// Same as [`validate_rows`].
pub fn apply_rows(
    family: &DeviceFamily,
    image: &CloneImage,
    rows: &[MemoryRow],
) -> Result<(CloneImage, usize), CloneError> {
    validate_rows(family, rows)?;

    let named: HashMap<u32, &MemoryRow> = rows.iter().map(|row| (row.location, row)).collect();
    let mut bytes = image.bytes().to_vec();
    let mut changed = 0;
    for location in 1..=family.layout.count {
        let erased = MemoryRow::empty(location);
        let row = named.get(&location).copied().unwrap_or(&erased);
        let range = family
            .layout
            .record(location)
            .map_err(|e| CloneError::InvalidRow(e.to_string()))?;
        let Some(record) = bytes.get_mut(range) else {
            continue;
        };
        let current = layout::decode(location, record);
        if same_channel(&current, row) {
            continue;
        }
        layout::encode(row, record)
            .map_err(|e| CloneError::InvalidRow(format!("location {location}: {e}")))?;
        changed += 1;
    }

    let next = CloneImage::new(image.key().clone(), bytes, image.size())?;
    Ok((next, changed))
}

/// Number of channel records that differ between two images.
///
/// A record missing from `before` counts as changed.
#[must_use]
pub fn changed_slots(family: &DeviceFamily, before: &[u8], after: &[u8]) -> usize {
    (1..=family.layout.count)
        .filter_map(|location| family.layout.record(location).ok())
        .filter(|range| before.get(range.clone()) != after.get(range.clone()))
        .count()
}

/// Rows compare equal when they describe the same stored channel. Text
/// fields are not stored in the record.
fn same_channel(stored: &MemoryRow, row: &MemoryRow) -> bool {
    if stored.is_empty() || row.is_empty() {
        return stored.is_empty() && row.is_empty();
    }
    let mut row = row.clone();
    row.name.clone_from(&stored.name);
    row.comment.clone_from(&stored.comment);
    *stored == row
}
