use thiserror::Error;

/// Repin error types
#[derive(Error, Debug)]
pub enum Error {
    /// Image reference could not be parsed
    #[error("invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Finder rule failed to compile
    #[error("invalid finder rule: {0}")]
    BadRule(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    BadConfig(String),

    /// Sentinel: the image matched an ignore rule. Stops the chain,
    /// the image is left untouched. Never surfaced to the user.
    #[error("image ignored")]
    Skip,

    /// No static mapping entry for a source in mappings-only mode
    #[error("no static mapping for '{0}'")]
    NoMapping(String),

    /// Registry manifest HEAD failed
    #[error("digest resolution failed for '{reference}': {message}")]
    DigestResolve { reference: String, message: String },

    /// The recorder saw two different results for one source
    #[error("conflicting mapping for '{reference}': '{existing}' vs '{incoming}'")]
    MappingConflict {
        reference: String,
        existing: String,
        incoming: String,
    },

    /// A static mapping target no longer matches the registry
    #[error("stale static mapping for '{reference}': recorded {recorded}, registry has {current}")]
    StaleMapping {
        reference: String,
        recorded: String,
        current: String,
    },

    /// Image copy failed
    #[error("copy of '{source_ref}' to '{target_ref}' failed: {message}")]
    Copy {
        source_ref: String,
        target_ref: String,
        message: String,
    },

    /// Vulnerability discovery has not completed yet
    #[error("vulnerability discovery not finished for '{0}'")]
    DiscoverNotFinished(String),

    /// No vulnerability discovery exists for the image
    #[error("no vulnerability discovery found for '{0}'")]
    DiscoveryNotFound(String),

    /// Scanner invocation or output parsing failed
    #[error("vulnerability scan of '{reference}' failed: {message}")]
    VulnScan { reference: String, message: String },

    /// CVEs at or above the configured threshold
    #[error("image '{reference}' violates the CVE policy: {cves}")]
    PolicyViolation { reference: String, cves: String },

    /// No verifiable attestation exists. Expected during the
    /// idempotence probe; not an error upward.
    #[error("no verifiable attestation found for '{0}'")]
    AttestationNotFound(String),

    /// Signing failed
    #[error("signing failed: {0}")]
    Sign(String),

    /// Attestation creation failed
    #[error("attestation of '{reference}' failed: {message}")]
    Attest { reference: String, message: String },

    /// Registry transport error
    #[error("registry error for '{reference}': {message}")]
    Registry { reference: String, message: String },

    /// The run was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Accumulated errors from a fan-out phase
    #[error("{}", join_errors(.0))]
    Multi(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// True for cancellation, which short-circuits error aggregation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// Collapse the errors collected by a fan-out phase.
///
/// A cancellation wins over everything else and is returned alone, so the
/// first task to observe it determines the run's error. Otherwise a single
/// error is returned as-is and several become [`Error::Multi`].
pub fn aggregate(errors: Vec<Error>) -> Option<Error> {
    if let Some(pos) = errors.iter().position(Error::is_cancelled) {
        let mut errors = errors;
        return Some(errors.swap_remove(pos));
    }
    match errors.len() {
        0 => None,
        1 => errors.into_iter().next(),
        _ => Some(Error::Multi(errors)),
    }
}

/// Result type alias for repin operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate(vec![]).is_none());
    }

    #[test]
    fn test_aggregate_single_passthrough() {
        let err = aggregate(vec![Error::Sign("kms unreachable".into())]).unwrap();
        assert!(matches!(err, Error::Sign(_)));
    }

    #[test]
    fn test_aggregate_cancellation_wins() {
        let err = aggregate(vec![
            Error::Sign("kms unreachable".into()),
            Error::Cancelled("interrupted".into()),
            Error::VulnScan {
                reference: "nginx:1".into(),
                message: "boom".into(),
            },
        ])
        .unwrap();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_aggregate_multi_joins_messages() {
        let err = aggregate(vec![Error::Sign("a".into()), Error::Sign("b".into())]).unwrap();
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'));
    }
}
