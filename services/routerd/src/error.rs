//! Router daemon error types

use thiserror::Error;

/// Startup failures of the daemon
///
/// Once the daemon runs, transport and protocol faults never surface as
/// errors: they become alarms plus event traffic, and only invariant
/// violations abort.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The local listen socket could not be created or bound
    #[error("cannot listen on '{url}': {source}")]
    Listen {
        url: String,
        #[source]
        source: network::NetworkError,
    },

    /// The termination pipe could not be created
    #[error("cannot create termination pipe: {source}")]
    TerminatePipe {
        #[source]
        source: network::NetworkError,
    },

    #[error(transparent)]
    Network(#[from] network::NetworkError),
}
