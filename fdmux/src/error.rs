//! Error types for fdmux operations.

/// Alias for `Result<T, fdmux::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by fdmux proxy and bootstrap operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport link failed. Every pending RPC has been failed and
    /// every registered descriptor torn down; the peer is gone.
    #[error("transport link down: {0}")]
    LinkDown(#[source] std::io::Error),

    /// A bootstrap step failed before the link was usable.
    #[error("bootstrap {op}: {source}")]
    Bootstrap {
        /// The bootstrap step that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An I/O error from proxy or bridge operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
