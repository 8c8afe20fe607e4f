//! blocking websocket client toolkit
//!
//! one [`WsClient`] owns one connection: url parsing, timed tcp/tls
//! connect, the rfc 6455 upgrade handshake, and a dedicated worker thread
//! that reads frames, answers pings, keeps the link alive with heartbeats
//! and runs the closing handshake. received messages and lifecycle events
//! are delivered through callbacks registered before `connect`.
//!
//! ```no_run
//! use ws_link::WsClient;
//!
//! let mut client = WsClient::new();
//! client
//!     .on_open(|| println!("open"))
//!     .on_text(|text| println!("[RECV] {text}"))
//!     .on_close(|| println!("closed"));
//! client.connect("wss://echo.example/chat").unwrap();
//! client.send_text("hello").unwrap();
//! client.disconnect();
//! ```

#![warn(missing_docs)]

pub use http;

/// websocket error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// frame codec impl
pub mod codec;
/// url parsing & opening handshake
pub mod protocol;
/// blocking stream & transport primitives
pub mod stream;
/// connection engine & user facing api
pub mod client;

pub use client::{ConnectionState, PayloadTransform, WsClient, WsConfig};
pub use errors::{ProtocolError, WsError};
pub use frame::{Frame, OpCode};
pub use protocol::{Endpoint, Mode};
