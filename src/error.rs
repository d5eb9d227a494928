use std::fmt;
use std::io;

/// Fatal failures from the core, matching the two fatal error kinds of the
/// design: log-open failure and (conceptually) allocation failure during the
/// module walk. Rust's allocator aborts the process on OOM rather than
/// returning an error, so only the log-open case is representable here.
#[derive(Debug)]
pub enum TrackingError {
    LogOpenFailed { path: std::path::PathBuf, source: io::Error },
}

impl fmt::Display for TrackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingError::LogOpenFailed { path, source } => {
                write!(f, "failed to open trace log {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for TrackingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackingError::LogOpenFailed { source, .. } => Some(source),
        }
    }
}
