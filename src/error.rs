//! Custom error types for the application.
//!
//! This module defines the primary error type, `CtlError`, for the entire
//! control layer. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure families:
//!
//! - **Transport**: channel connect/read/write failures and enum-label
//!   mismatches surfaced by the channel-access adapter.
//! - **Protocol**: blob/JSON/XML decode failures and unexpected replies from
//!   the block server.
//! - **State**: a verb invoked in a run state that does not permit it.
//! - **Argument**: user-supplied names, numbers or labels that do not resolve.
//! - **Composition**: mutually exclusive verb options supplied together.
//! - **Script**: user script loading and static-check failures.
//!
//! Every user-facing verb catches `CtlError` at its outer edge, prints a
//! single `ERROR:` line and either swallows or re-raises depending on the
//! session's `exceptions_raised` flag.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the control-layer error type.
pub type CtlResult<T> = std::result::Result<T, CtlError>;

#[derive(Error, Debug)]
pub enum CtlError {
    // -- transport ----------------------------------------------------------
    #[error("Channel '{0}' could not be connected")]
    NotConnected(String),

    #[error("Channel '{0}' refused read access")]
    NoReadAccess(String),

    #[error("Channel '{0}' refused write access")]
    NoWriteAccess(String),

    #[error("'{value}' is not a state of enum channel '{channel}' (valid: {})", .choices.join(", "))]
    InvalidEnumString {
        channel: String,
        value: String,
        choices: Vec<String>,
    },

    #[error("Timed out after {waited:?} on channel '{channel}'")]
    Timeout { channel: String, waited: Duration },

    // -- protocol -----------------------------------------------------------
    #[error("Blob decode failed: {0}")]
    BlobDecode(String),

    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parse failed: {0}")]
    Xml(String),

    #[error("No leaf named '{leaf}' in {document} settings")]
    LeafNotFound { document: String, leaf: String },

    #[error("Block server replied '{reply}' on '{channel}'")]
    UnexpectedReply { channel: String, reply: String },

    // -- state --------------------------------------------------------------
    #[error("Cannot {verb}: DAE is in {state}")]
    WrongRunState { verb: String, state: String },

    // -- arguments ----------------------------------------------------------
    #[error("No block with name '{0}'")]
    UnknownBlock(String),

    #[error("'{name}' must be numeric, got '{value}'")]
    NotNumeric { name: String, value: String },

    #[error("'{value}' is not a synchronisation source (valid: {})", .choices.join(", "))]
    UnknownSyncSource {
        value: String,
        choices: Vec<String>,
    },

    #[error("'{value}' is not a valid {name}")]
    InvalidLabel { name: String, value: String },

    #[error("Period must be in 1..=8, got {0}")]
    PeriodOutOfRange(i64),

    #[error("Period must be in 1..={max}, got {period}")]
    InvalidPeriod { period: i64, max: i64 },

    #[error("Nothing to wait for: no condition supplied")]
    NothingToWaitFor,

    #[error("Waiting on a block needs at least one of value, low or high")]
    BandWithoutLimits,

    #[error("Time-channel regime must be in 1..=6, got {0}")]
    RegimeOutOfRange(i64),

    #[error("Time-channel range must be in 1..=5, got {0}")]
    RangeOutOfRange(i64),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // -- composition --------------------------------------------------------
    #[error("Cannot set a block with both 'wait' and 'runcontrol'")]
    WaitWithRunControl,

    #[error("Runcontrol and wait options are not allowed when setting multiple blocks")]
    OptionsWithMultipleBlocks,

    // -- scripts ------------------------------------------------------------
    #[error("Script file not found: {0}")]
    ScriptMissing(PathBuf),

    #[error("Script parse failed: {0}")]
    ScriptParse(String),

    #[error("Script check failed:\n{}", .0.join("\n"))]
    ScriptCheck(Vec<String>),

    // -- surfaced from the DAE ---------------------------------------------
    #[error("DAE reported: {0}")]
    Dae(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CtlError::UnknownBlock("temp".to_string());
        assert_eq!(err.to_string(), "No block with name 'temp'");
    }

    #[test]
    fn test_invalid_enum_lists_choices() {
        let err = CtlError::InvalidEnumString {
            channel: "DAE:VETO".into(),
            value: "maybe".into(),
            choices: vec!["Disabled".into(), "Enabled".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("maybe"));
        assert!(msg.contains("Disabled, Enabled"));
    }

    #[test]
    fn test_script_check_joins_violations() {
        let err = CtlError::ScriptCheck(vec![
            "Line 3: 'end' command without brackets".into(),
            "Line 7: 'begin' command without brackets".into(),
        ]);
        assert!(err.to_string().contains("Line 3"));
        assert!(err.to_string().contains("Line 7"));
    }
}
