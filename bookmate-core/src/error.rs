use std::path::PathBuf;

use crate::controller::ControllerState;

/// Errors surfaced by the reading-progress tracker.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("failed to load document {target}")]
    Load {
        target: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("failed to render page {page}")]
    Render {
        page: usize,
        #[source]
        cause: anyhow::Error,
    },

    #[error("page {page} is outside 1..={total}")]
    OutOfRange { page: usize, total: usize },

    #[error("no chapter with id {id}")]
    UnknownChapter { id: usize },

    #[error("failed to persist reading progress")]
    Storage(#[source] anyhow::Error),

    #[error("reader is not ready (state: {0:?})")]
    NotReady(ControllerState),

    #[error("invalid configuration {path:?}")]
    Config {
        path: PathBuf,
        #[source]
        cause: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_display() {
        let e = ReaderError::OutOfRange { page: 12, total: 10 };
        assert_eq!(format!("{e}"), "page 12 is outside 1..=10");
    }

    #[test]
    fn render_error_keeps_cause() {
        let e = ReaderError::Render {
            page: 3,
            cause: anyhow::anyhow!("engine crashed"),
        };
        assert_eq!(format!("{e}"), "failed to render page 3");
        let source = std::error::Error::source(&e).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("engine crashed"));
    }

    #[test]
    fn not_ready_mentions_state() {
        let e = ReaderError::NotReady(ControllerState::Loading);
        assert_eq!(format!("{e}"), "reader is not ready (state: Loading)");
    }
}
