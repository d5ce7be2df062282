use thiserror::Error;

/// QMI protocol error code for "no effect": the request was valid but the
/// modem was already in the requested state.
pub(crate) const QMI_ERR_NO_EFFECT: u16 = 26;

/// Errors surfaced by the QMI client stack.
///
/// `NoEffect` is deliberately its own variant rather than a success: some
/// call sites (stopping an already-dead session, re-applying autoconnect
/// settings) tolerate it, others must not silently accept a no-op.
#[derive(Debug, Error)]
pub enum QmiError {
    #[error("modem transport I/O failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out waiting for a modem response")]
    Timeout,

    #[error("modem transport is shut down")]
    Disconnected,

    #[error("malformed modem message: {0}")]
    Malformed(&'static str),

    #[error("required field missing from modem response: {0}")]
    MissingField(&'static str),

    #[error("modem rejected the request: result={result}, error={error}")]
    Modem { result: u16, error: u16 },

    #[error("request had no effect")]
    NoEffect,

    #[error(
        "data session refused: error={error}, reason={reason:?}, verbose={verbose:?}"
    )]
    SessionRefused {
        error: u16,
        /// Call-end reason, verbatim from the modem when present.
        reason: Option<u16>,
        /// Verbose call-end `(type, reason)` pair, verbatim when present.
        verbose: Option<(u16, u16)>,
    },

    #[error("operating mode read-back disagrees with the requested mode")]
    ModeReadBack,
}
