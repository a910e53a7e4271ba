//! Instrument identity resolver.
//!
//! Every channel name crossing the transport is `<prefix><relative>`. The
//! prefix is derived once per session from an identifier: an explicit prefix
//! (`IN:` / `TE:`), a host name (`NDX` / `NDE` / `NDW`), or a bare instrument
//! name. Overlong names are truncated to their first six characters plus the
//! two-hex-digit CRC-8 of the full name, so that distinct long hosts still
//! resolve to distinct namespaces.

use crc::{Crc, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Longest instrument name that is carried verbatim in the prefix.
const MAX_NAME_LEN: usize = 8;

/// Number of leading characters kept when a name is truncated.
const TRUNCATED_KEEP: usize = 6;

/// Uppercase two-hex-digit CRC-8 of a string; empty input yields "".
pub fn crc8hex(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    format!("{:02X}", CRC8.checksum(text.as_bytes()))
}

/// Which half of the channel namespace an identifier lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Group {
    Instrument,
    Test,
}

impl Group {
    fn tag(self) -> &'static str {
        match self {
            Group::Instrument => "IN:",
            Group::Test => "TE:",
        }
    }
}

/// A resolved channel-namespace prefix.
///
/// Invariant: the string form is either empty or ends in `:`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvPrefix(String);

impl PvPrefix {
    /// Empty prefix: channel names pass through untouched.
    pub fn none() -> Self {
        PvPrefix(String::new())
    }

    /// Derive a prefix from an instrument identifier.
    ///
    /// Recognised forms (case-insensitive):
    /// - explicit prefix `IN:name` / `TE:name`
    /// - host name `NDXname` / `NDEname` (instrument machines, tag stripped)
    /// - host name `NDWname` (test machines, full host name kept)
    /// - bare instrument name
    ///
    /// Anything else containing `:` is taken as an already-formed prefix and
    /// passed through unchanged.
    pub fn resolve(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            return PvPrefix::none();
        }
        let upper = trimmed.to_uppercase();
        let upper = upper.strip_suffix(':').unwrap_or(&upper);

        let (group, name) = if let Some(rest) = upper.strip_prefix("IN:") {
            (Group::Instrument, rest.to_string())
        } else if let Some(rest) = upper.strip_prefix("TE:") {
            (Group::Test, rest.to_string())
        } else if let Some(rest) = upper
            .strip_prefix("NDX")
            .or_else(|| upper.strip_prefix("NDE"))
        {
            (Group::Instrument, rest.to_string())
        } else if upper.starts_with("NDW") {
            // Test machines keep the whole host name.
            (Group::Test, upper.to_string())
        } else if trimmed.contains(':') {
            // Unrecognised but already namespace-shaped: use verbatim.
            return PvPrefix(trimmed.to_string());
        } else {
            (Group::Instrument, upper.to_string())
        };

        PvPrefix(format!("{}{}:", group.tag(), shorten(&name)))
    }

    /// Prepend this prefix to a relative channel name.
    pub fn apply(&self, relative: &str) -> String {
        format!("{}{}", self.0, relative)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PvPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncate an overlong name to first-6 + CRC-8 of the full name.
fn shorten(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let head: String = name.chars().take(TRUNCATED_KEEP).collect();
    format!("{}{}", head, crc8hex(name))
}

/// Identifier for this session when none was supplied explicitly: the
/// `MYPVPREFIX` environment variable, falling back to the host name.
pub fn default_identifier() -> Option<String> {
    if let Ok(prefix) = std::env::var("MYPVPREFIX") {
        if !prefix.trim().is_empty() {
            return Some(prefix);
        }
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}
