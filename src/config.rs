//! Application settings.
//!
//! Settings are layered with Figment: built-in defaults, then an optional
//! `beamctl.toml`, then `BEAMCTL_*` environment variables. The instrument
//! identifier is special-cased at session startup: an explicit
//! `set_instrument` wins, then the configured value, then the `MYPVPREFIX`
//! environment variable, then the host name.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CtlError, CtlResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Instrument identifier (host name, bare name or explicit prefix).
    /// `None` defers to `MYPVPREFIX` / the host name at startup.
    pub instrument: Option<String>,

    /// Directory bare script filenames are resolved against.
    pub scripts_dir: PathBuf,

    /// Directory the daily command log is written to.
    pub log_dir: PathBuf,

    /// Timeout for the initial connect of a channel, milliseconds.
    pub connect_timeout_ms: u64,

    /// Timeout for individual get/set operations, milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instrument: None,
            scripts_dir: PathBuf::from("scripts"),
            log_dir: PathBuf::from("log"),
            connect_timeout_ms: 2_000,
            io_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Load settings from `beamctl.toml` (if present) and the environment.
    pub fn load() -> CtlResult<Self> {
        Self::load_from(Path::new("beamctl.toml"))
    }

    /// Load settings with an explicit TOML path (used by tests).
    pub fn load_from(toml_path: &Path) -> CtlResult<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(toml_path))
            .merge(Env::prefixed("BEAMCTL_"))
            .extract()
            .map_err(|e| CtlError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.scripts_dir, PathBuf::from("scripts"));
        assert_eq!(s.connect_timeout().as_millis(), 2_000);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beamctl.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "instrument = \"LARMOR\"\nio_timeout_ms = 250").unwrap();

        let s = Settings::load_from(&path).unwrap();
        assert_eq!(s.instrument.as_deref(), Some("LARMOR"));
        assert_eq!(s.io_timeout_ms, 250);
        // Untouched keys keep their defaults.
        assert_eq!(s.connect_timeout_ms, 2_000);
    }
}
