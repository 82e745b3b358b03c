use thiserror::Error;

/// Errors a [`ProbeTransport`](crate::probe::ProbeTransport) can report for a single probe.
///
/// None of these are fatal to a session: the engine records every one of them as a
/// lost probe for the hop that sent it.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to open raw ICMP socket (need root or CAP_NET_RAW): {0}")]
    Socket(#[source] std::io::Error),

    #[error("probe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot build echo request packet")]
    Packet,

    #[error("probe task aborted: {0}")]
    Aborted(String),
}

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no tokio runtime is available to drive the probing tasks")]
    NoRuntime,
}
