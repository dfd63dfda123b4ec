use std::error::Error as StdError;

/// Common error type for `embers_core`.
///
/// Variants follow the failure taxonomy of a load run: source fetch, target
/// write, record shape, and run-state access. Backend implementations should
/// keep the underlying error chain via the `*_err` constructors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A fetched record does not match the declared table schema.
    #[error("data shape error: {0}")]
    DataShape(String),

    #[error("source error: {context}")]
    Source {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("source error: {0}")]
    SourceMessage(String),

    #[error("store error: {context}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("store error: {0}")]
    StoreMessage(String),

    /// The run-state store (watermark, run history) could not be read or written.
    #[error("run state error: {context}")]
    State {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("run state error: {0}")]
    StateMessage(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "embers.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn source_err(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn store_err(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn state_err(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::State {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether replaying the whole run may succeed without operator action.
    ///
    /// Data-shape and configuration errors are not transient: retrying would
    /// fetch the same offending records again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Source { .. }
                | Self::SourceMessage(_)
                | Self::Store { .. }
                | Self::StoreMessage(_)
                | Self::State { .. }
                | Self::StateMessage(_)
        )
    }

    /// Short machine-readable label used in logs and run records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::DataShape(_) => "data_shape",
            Self::Source { .. } | Self::SourceMessage(_) => "source",
            Self::Store { .. } | Self::StoreMessage(_) => "store",
            Self::State { .. } | Self::StateMessage(_) => "state",
            Self::Backend { .. } | Self::BackendMessage(_) => "backend",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_taxonomy() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(Error::source_err("fetch page", io()).is_transient());
        assert!(Error::store_err("commit", io()).is_transient());
        assert!(Error::state_err("read watermark", io()).is_transient());
        assert!(!Error::DataShape("record 3 missing id".into()).is_transient());
        assert!(!Error::InvalidInput("chunk_size must be > 0".into()).is_transient());
    }

    #[test]
    fn source_chain_is_preserved() {
        let err = Error::store_err(
            "upsert chunk",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.to_string(), "store error: upsert chunk");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("disk full"));
        assert_eq!(err.kind(), "store");
    }
}
