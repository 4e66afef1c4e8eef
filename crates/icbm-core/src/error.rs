//! Error type shared by every engine operation.

use std::path::PathBuf;

/// Failures surfaced by the engine.
///
/// I/O and decode errors always carry the path that was being touched so a
/// log line is enough to find the offending file on disk.
#[derive(Debug, thiserror::Error)]
pub enum IcbmError {
    /// A file or directory could not be opened, read, written or renamed.
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored or received payload was not valid (gzip or JSON).
    #[error("couldn't decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A report could not be serialized.
    #[error("couldn't encode report for {tap}: {source}")]
    Encode {
        tap: String,
        #[source]
        source: serde_json::Error,
    },

    /// A request payload was not a telemetry batch.
    #[error("malformed telemetry payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The tap name was empty after sanitizing.
    #[error("invalid tap name {0:?}")]
    InvalidTapName(String),
}

impl IcbmError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Decode failures are skipped by batch jobs rather than aborting them.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Payload(_))
    }
}

pub type Result<T> = std::result::Result<T, IcbmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_the_path() {
        let err = IcbmError::io(
            "couldn't open",
            "/data/tap/x.tsv",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("couldn't open"));
        assert!(msg.contains("/data/tap/x.tsv"));
        assert!(!err.is_decode());
    }

    #[test]
    fn test_payload_errors_are_decode_class() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(IcbmError::from(json_err).is_decode());
    }
}
