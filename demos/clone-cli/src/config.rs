//! Layered settings: TOML file, then environment, then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::Context;
use radio_clone_core::{CloneContext, CloneTiming};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "RADIO_CLONE_CONFIG";
pub const PORT_ENV: &str = "RADIO_CLONE_PORT";

const DEFAULT_DEVICE: &str = "p3107.CompactHandheld";

/// Settings as they appear in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: Option<String>,
    /// Device key, `family.class`.
    pub device: Option<String>,
    pub baud: Option<u32>,
    pub timing: CloneTiming,
}

/// Values given on the command line; each one wins over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<String>,
    pub device: Option<String>,
    pub baud: Option<u32>,
}

impl Settings {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns the TOML error for malformed input or unknown keys.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read `path`, or the file named by `RADIO_CLONE_CONFIG`, or fall back
    /// to defaults when neither is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Layer the environment's port and then the command line over the file.
    #[must_use]
    pub fn layered(mut self, env_port: Option<String>, overrides: Overrides) -> Self {
        if env_port.is_some() {
            self.port = env_port;
        }
        if overrides.port.is_some() {
            self.port = overrides.port;
        }
        if overrides.device.is_some() {
            self.device = overrides.device;
        }
        if overrides.baud.is_some() {
            self.baud = overrides.baud;
        }
        self
    }

    #[must_use]
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    #[must_use]
    pub const fn context(&self) -> CloneContext {
        CloneContext {
            timing: self.timing,
            baud_override: self.baud,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_parse_file() {
        let settings = Settings::from_toml(
            r#"
            port = "/dev/ttyUSB0"
            baud = 19200

            [timing]
            read_timeout = 800
            "#,
        )
        .unwrap();
        assert_eq!(settings.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(settings.device(), DEFAULT_DEVICE);
        assert_eq!(settings.timing.read_timeout, Duration::from_millis(800));
        assert_eq!(settings.timing.settle, Duration::from_millis(350));
        assert_eq!(settings.context().baud_rate(9600), 19200);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Settings::from_toml("prot = \"/dev/ttyS0\"").is_err());
    }

    #[test]
    fn test_precedence() {
        let file = Settings {
            port: Some("/dev/file".into()),
            device: Some("p3107.CompactHandheld".into()),
            ..Settings::default()
        };

        let from_env = file.clone().layered(Some("/dev/env".into()), Overrides::default());
        assert_eq!(from_env.port.as_deref(), Some("/dev/env"));

        let from_cli = file.layered(
            Some("/dev/env".into()),
            Overrides {
                port: Some("/dev/cli".into()),
                baud: Some(4800),
                ..Overrides::default()
            },
        );
        assert_eq!(from_cli.port.as_deref(), Some("/dev/cli"));
        assert_eq!(from_cli.device(), "p3107.CompactHandheld");
        assert_eq!(from_cli.context().baud_rate(9600), 4800);
    }
}
