//! Per-operation timing and line settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default pause after toggling control lines.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(350);

/// Default deadline for a single read round-trip.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Default pause between the break marker and the program command.
pub const DEFAULT_ENTER_PAUSE: Duration = Duration::from_millis(100);

/// Timing knobs for one clone operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneTiming {
    /// Settle delay after setting DTR/RTS.
    #[serde(with = "millis")]
    pub settle: Duration,
    /// Deadline for each read.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Pause after the break marker when entering programming mode.
    #[serde(with = "millis")]
    pub enter_pause: Duration,
}

impl Default for CloneTiming {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            enter_pause: DEFAULT_ENTER_PAUSE,
        }
    }
}

impl CloneTiming {
    /// Timing with every delay shortened, for loop-back links.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            settle: Duration::ZERO,
            read_timeout: Duration::from_millis(50),
            enter_pause: Duration::ZERO,
        }
    }

    /// Override the read deadline.
    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// Context shared by every clone operation a manager runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneContext {
    pub timing: CloneTiming,
    /// Overrides the family's baud rate when opening a session.
    pub baud_override: Option<u32>,
}

impl CloneContext {
    #[must_use]
    pub const fn new(timing: CloneTiming) -> Self {
        Self {
            timing,
            baud_override: None,
        }
    }

    /// Baud rate to use for a family that declares `family_baud`.
    #[must_use]
    pub fn baud_rate(&self, family_baud: u32) -> u32 {
        self.baud_override.unwrap_or(family_baud)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
