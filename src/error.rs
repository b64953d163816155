//! Error taxonomy for a single USB/IP connection: malformed framing and
//! unsupported features end the session outright, while host USB stack
//! failures turn into a negative `RET_SUBMIT` status so the session keeps
//! running.

use thiserror::Error;

use crate::host::HostUsbError;

/// Everything that can end a session's packet loop.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed header, unknown opcode, unknown devid, or a length mismatch.
    /// The connection is closed without attempting a reply, since the
    /// framing that would carry one cannot be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A feature this server does not implement (DEVINFO, UNLINK, RESET_DEV,
    /// isochronous transfers). The connection is closed.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// The host USB library rejected a pass-through transfer. Unlike the
    /// other two variants this does not necessarily end the session: callers
    /// that can still produce a well-formed `RET_SUBMIT` convert this into a
    /// negative status instead of propagating it.
    #[error(transparent)]
    HostUsb(#[from] HostUsbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(String),
}

/// errno-style negative status codes used in `ret_submit.status`.
pub const EPIPE: i32 = -32;
pub const EIO: i32 = -5;

/// Maps a host USB error to the negative status carried in `RET_SUBMIT`.
///
/// A stalled endpoint maps to `-EPIPE`; anything else falls back to `-EIO`.
pub fn status_for(err: &HostUsbError) -> i32 {
    match err {
        HostUsbError::Pipe => EPIPE,
        _ => EIO,
    }
}
