use thiserror::Error;

use crate::{frame::OpCode, ConnectionState};

/// errors surfaced by connect, send and the worker loop
#[derive(Debug, Error)]
pub enum WsError {
    /// url failed strict `ws[s]://host[:port][/path][?query]` validation
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    /// dns, tcp or steady-state transport failure
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    /// tls client handshake failure
    #[error("tls failed `{0}`")]
    TlsFailed(String),
    /// upgrade response missing or mismatching a required field
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// connect, handshake or pong deadline elapsed
    #[error("timed out while {0}")]
    Timeout(String),
    /// peer violated the framing rules
    #[error("{error}")]
    Protocol {
        /// close code to send back, usually 1002
        close_code: u16,
        /// the concrete violation
        error: ProtocolError,
    },
    /// peer dropped the tcp link without a closing handshake
    #[error("connection closed by peer")]
    ConnClosed,
    /// operation requires a different connection state
    #[error("io on invalid connection state {0:?}")]
    InvalidConnState(ConnectionState),
    /// caller passed an argument the protocol cannot express
    #[error("invalid argument `{0}`")]
    InvalidArgument(String),
    /// transport level io error
    #[error("io error {0:?}")]
    IOError(Box<dyn std::error::Error + Send + Sync>),
}

impl From<std::io::Error> for WsError {
    fn from(e: std::io::Error) -> Self {
        WsError::IOError(Box::new(e))
    }
}

/// errors during decode frame from bytes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// rsv bits set without a negotiated extension
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    /// opcode outside the defined table
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    /// 8 byte extended length with the high bit set
    #[error("invalid extended payload length")]
    InvalidExtendedLen,
    /// continuation frame with no initiating data frame
    #[error("missing init fragmented frame")]
    MissInitialFragmentedFrame,
    /// new data frame while a fragmented message is in flight
    #[error("not continue frame after init fragmented frame")]
    NotContinueFrameAfterFragmented,
    /// control frame with fin unset
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    /// control frame payload over 125 bytes
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    /// close frame payload of exactly one byte
    #[error("invalid close frame payload len, expect 0, >= 2")]
    InvalidCloseFramePayload,
    /// close code outside the sendable ranges
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// text message that is not valid utf-8
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    /// frame or reassembled message payload over the configured cap
    #[error("payload too large, max payload size {0}")]
    PayloadTooLarge(usize),
    /// frame kind the engine does not handle
    #[error("unsupported frame {0:?}")]
    UnsupportedFrame(OpCode),
}
