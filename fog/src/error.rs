//! Error types for fog operations.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Alias for `Result<T, fog::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by machine and log multiplexer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The emulator binary could not be found on `$PATH`.
    #[error("finding {program} binary: {source}")]
    Binary {
        /// Program name that was looked up.
        program: &'static str,
        /// Underlying lookup error.
        source: io::Error,
    },

    /// No per-user runtime directory exists to hold machine sockets.
    #[error("generating socket file path: no runtime directory available")]
    NoRuntimeDir,

    /// The socket directory could not be created.
    #[error("generating socket file path {path}: {source}")]
    SocketPath {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A path handed to the emulator is not valid UTF-8.
    #[error("path {} is not valid UTF-8", path.display())]
    NonUtf8Path {
        /// The offending path.
        path: PathBuf,
    },

    /// The emulator process could not be spawned.
    #[error("starting machine: {0}")]
    Spawn(#[source] io::Error),

    /// [`Machine::conn`](crate::Machine::conn) was called before `start`.
    #[error("machine has not been started")]
    NotStarted,

    /// Every dial attempt against the primary socket failed.
    #[error("failed to open connection to {} after {attempts} attempts", path.display())]
    Connect {
        /// Primary socket path.
        path: PathBuf,
        /// Number of dial attempts made.
        attempts: u32,
        /// Error from the last attempt, shared between waiting callers.
        source: Arc<io::Error>,
    },

    /// The log multiplexer was built outside a tokio runtime.
    #[error("log flushing needs a tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// An I/O error from the log sink or socket plumbing.
    #[error(transparent)]
    Io(#[from] io::Error),
}
