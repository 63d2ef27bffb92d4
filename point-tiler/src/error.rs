use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Errors surfaced by a conversion run.
///
/// Not every failure kind is raised: schema mismatches zero-fill the
/// missing attribute with a warning, transform setup failures downgrade
/// to the identity with a warning, and depth-cap discards are counted in
/// the statistics. Decode failures abort only the offending source. What
/// remains is listed below with the process exit code it maps to.
#[derive(Debug)]
pub enum TilerError {
    /// A named source does not exist. Reported per source; the run
    /// continues with the remaining sources unless none are left.
    InputNotFound { path: String },
    /// A malformed input record; the whole source is aborted.
    Decode { path: String, message: String },
    /// Persistence failure, fatal for the run.
    Io { context: String, source: io::Error },
    /// `r.json` already present with `ABORT_IF_EXISTS`.
    OutputExists { path: String },
    /// Rejected configuration, including INCREMENTAL reconciliation
    /// failures.
    InvalidConfig { message: String },
    /// The run's cancellation token was triggered.
    Cancelled,
}

impl TilerError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        TilerError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        TilerError::InvalidConfig {
            message: message.into(),
        }
    }

    /// CLI exit code: 0 success, 1 usage, 2 I/O, 3 decode, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            TilerError::InvalidConfig { .. } | TilerError::OutputExists { .. } => 1,
            TilerError::Io { .. } | TilerError::InputNotFound { .. } => 2,
            TilerError::Decode { .. } => 3,
            TilerError::Cancelled => 4,
        }
    }
}

impl fmt::Display for TilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TilerError::InputNotFound { path } => {
                write!(f, "can't open input file \"{}\"", path)
            }
            TilerError::Decode { path, message } => {
                write!(f, "decode error in \"{}\": {}", path, message)
            }
            TilerError::Io { context, source } => {
                write!(f, "I/O error while {}: {}", context, source)
            }
            TilerError::OutputExists { path } => write!(
                f,
                "output directory \"{}\" is not empty; pass --overwrite to replace it",
                path
            ),
            TilerError::InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
            TilerError::Cancelled => write!(f, "conversion cancelled"),
        }
    }
}

impl StdError for TilerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TilerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(
            TilerError::invalid_config("spacing missing").exit_code(),
            1
        );
        let io_err = TilerError::io("storing node r0", io::Error::new(io::ErrorKind::Other, "x"));
        assert_eq!(io_err.exit_code(), 2);
        let decode = TilerError::Decode {
            path: "a.xyz".into(),
            message: "line 3".into(),
        };
        assert_eq!(decode.exit_code(), 3);
        assert_eq!(TilerError::Cancelled.exit_code(), 4);
    }

    #[test]
    fn display_carries_the_path() {
        let err = TilerError::InputNotFound {
            path: "missing.las".into(),
        };
        assert!(err.to_string().contains("missing.las"));
    }
}
