#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod abi;
pub mod buffer;
pub mod envelope;
mod version;

#[cfg(any(feature = "client", feature = "host"))]
mod reentry;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "host")]
pub mod host;

// Re-export macros
#[cfg(feature = "client")]
pub use rpc_plugin_macros::plugin_service;

// Re-export libloading library
#[cfg(feature = "host")]
pub use libloading::Library as PluginDynamicLibrary;

/// Re-exported libc types for convenience.
pub use libc;

pub use abi::RequestFn;
pub use buffer::OwnedBuffer;
pub use envelope::{ErrorKind, ServiceError};
pub use version::{ApiVersion, API_VERSION, API_VERSION_STR};

/// The result type returned by plugin functions.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned from plugin functions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error returned from libloading when trying to open the dynamic library.
    #[error("An error while opening the plugin library: {0}")]
    DynamicLibrary(#[from] libloading::Error),

    /// An I/O error, e.g. while spawning a worker thread.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The library does not export one of the functions every plugin must provide.
    #[error("The library is not a plugin, it does not export `{symbol}`: {source}")]
    MissingSymbol {
        /// Name of the missing export.
        symbol: &'static str,
        /// Error reported by the loader.
        source: libloading::Error,
    },

    /// The plugin reported an empty or non UTF-8 service name.
    #[error("The plugin's service name is invalid: {0}")]
    InvalidName(String),

    /// The plugin reported a different name the second time it was asked.
    #[error("The plugin's service name changed between calls (`{first}` then `{second}`).")]
    UnstableName {
        /// Name returned by the first call.
        first: String,
        /// Name returned by the second call.
        second: String,
    },

    /// The plugin was built against an API version this host does not support.
    #[error("The plugin's API version {plugin} is not compatible with host API version {host}.")]
    IncompatibleVersion {
        /// Version declared by the plugin.
        plugin: ApiVersion,
        /// Version supported by the host.
        host: ApiVersion,
    },

    /// A lifecycle function was used out of order.
    #[error("The plugin `{plugin}` is {actual}, expected it to be {expected}.")]
    InvalidState {
        /// Service name of the plugin.
        plugin: String,
        /// State the operation requires.
        expected: &'static str,
        /// State the plugin is in.
        actual: &'static str,
    },

    /// A plugin was called, started or stopped from inside a call to the same plugin on the
    /// same thread, e.g. by a request handler answering that plugin.
    #[error("`{operation}` on plugin `{plugin}` was refused: the plugin is already busy on this thread.")]
    Reentrant {
        /// Service name of the plugin.
        plugin: String,
        /// Method or lifecycle function that was refused.
        operation: String,
    },

    /// A null pointer was passed together with a non-zero length.
    #[error("A null buffer was passed with length {0}.")]
    NullBuffer(usize),

    /// The other side returned a zero-length response.
    #[error("The response is empty.")]
    EmptyResponse,

    /// The other side returned bytes that are not a response envelope.
    #[error("The response is malformed: {0}")]
    MalformedResponse(String),

    /// The other side answered with an error.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The host callback was used after the plugin was stopped.
    #[error("The host callback has been revoked because the plugin was stopped.")]
    Revoked,

    /// A call did not finish within the configured time.
    #[error("The call to `{method}` did not finish within {timeout:?}.")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Time limit that was exceeded.
        timeout: std::time::Duration,
    },

    /// The worker thread running a call went away without answering.
    #[error("The worker running `{0}` went away without a response.")]
    WorkerLost(String),
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Statically assert an expression with an error message.
///
/// This is used internally by the `plugin_service!` macro.
#[macro_export]
macro_rules! static_assert {
    ($exp:expr, $msg:expr) => {
        #[allow(unused_must_use)]
        const _: () = {
            if !($exp) {
                core::panic!("{}", $msg);
            }

            ()
        };
    };
}
