use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::codec::{FrameConfig, FrameDecoder};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{gen_mask, Frame, OpCode};
use crate::protocol::{perform_handshake, Endpoint};
use crate::stream::{tcp_connect, wrap_tls, SliceRead, Transport, WsStream};

/// bound on each blocking receive call; keeps the worker responsive to the
/// stop flag and heartbeat ticks without busy-waiting
const SLICE_TIMEOUT: Duration = Duration::from_millis(200);

/// lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// no link; the only state `connect` accepts
    Closed,
    /// tcp/tls/handshake in flight
    Connecting,
    /// handshake done, frames flowing
    Open,
    /// closing handshake in flight, either side initiated
    Closing,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Closed => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// message payload transform hook
///
/// placeholder seam for a compression extension. the core never negotiates
/// one, so configuring a transform makes `connect` fail rather than emit
/// frames the peer cannot interpret.
pub trait PayloadTransform: Send + Sync {
    /// transform an outgoing message payload
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, WsError>;
    /// undo the transform on an incoming message payload
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, WsError>;
}

/// connection options
#[derive(Clone)]
pub struct WsConfig {
    /// upper bound on tcp connect, tls and the upgrade exchange combined
    pub connect_timeout: Duration,
    /// largest accepted frame or reassembled message payload
    pub max_frame_size: usize,
    /// period between unsolicited pings while open; zero disables
    pub heartbeat_interval: Duration,
    /// how long to await a pong before declaring the link dead; zero
    /// disables enforcement
    pub pong_timeout: Duration,
    /// extra headers appended verbatim to the upgrade request
    pub headers: HashMap<String, String>,
    /// extension token to parameter string, emitted in
    /// `Sec-WebSocket-Extensions`
    pub extensions: Vec<(String, String)>,
    /// optional compression hook, see [`PayloadTransform`]
    pub transform: Option<Arc<dyn PayloadTransform>>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            max_frame_size: 1024 * 1024,
            heartbeat_interval: Duration::from_millis(30_000),
            pong_timeout: Duration::from_millis(10_000),
            headers: HashMap::new(),
            extensions: Vec::new(),
            transform: None,
        }
    }
}

impl std::fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("headers", &self.headers)
            .field("extensions", &self.extensions)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

type OpenFn = Box<dyn Fn() + Send + Sync>;
type TextFn = Box<dyn Fn(String) + Send + Sync>;
type BinaryFn = Box<dyn Fn(Bytes) + Send + Sync>;
type CloseFn = Box<dyn Fn() + Send + Sync>;
type ErrorFn = Box<dyn Fn(WsError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    open: Option<OpenFn>,
    text: Option<TextFn>,
    binary: Option<BinaryFn>,
    close: Option<CloseFn>,
    error: Option<ErrorFn>,
}

impl Callbacks {
    fn emit_open(&self) {
        if let Some(cb) = &self.open {
            cb()
        }
    }

    fn emit_text(&self, text: String) {
        if let Some(cb) = &self.text {
            cb(text)
        }
    }

    fn emit_binary(&self, data: Bytes) {
        if let Some(cb) = &self.binary {
            cb(data)
        }
    }

    fn emit_close(&self) {
        if let Some(cb) = &self.close {
            cb()
        }
    }

    fn emit_error(&self, err: WsError) {
        if let Some(cb) = &self.error {
            cb(err)
        }
    }
}

/// state the user thread and the worker both touch
struct Shared {
    transport: Transport,
    state: Arc<AtomicU8>,
    stop: AtomicBool,
    close_fired: AtomicBool,
    pong_deadline: Mutex<Option<Instant>>,
    pong_timeout: Duration,
    callbacks: Arc<Callbacks>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn cas_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// encode and write one frame; the transport lock keeps whole frames
    /// from interleaving on the wire
    fn send_frame(&self, frame: &Frame) -> Result<(), WsError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        self.transport.send_all(&buf)
    }

    fn arm_pong_timer(&self) {
        if self.pong_timeout.is_zero() {
            return;
        }
        let mut slot = self.pong_deadline.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(Instant::now() + self.pong_timeout);
        }
    }

    fn clear_pong_timer(&self) {
        *self.pong_deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn pong_expired(&self) -> bool {
        let slot = self.pong_deadline.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*slot, Some(deadline) if Instant::now() > deadline)
    }

    fn emit_close_once(&self) {
        if !self.close_fired.swap(true, Ordering::SeqCst) {
            self.callbacks.emit_close();
        }
    }
}

/// blocking websocket client
///
/// one dedicated worker thread drives the receive loop once `connect`
/// succeeds; callbacks are invoked from that thread and must not block
/// indefinitely. register callbacks before calling `connect`. dropping
/// the client disconnects.
pub struct WsClient {
    config: WsConfig,
    callbacks: Arc<Callbacks>,
    state: Arc<AtomicU8>,
    shared: Option<Arc<Shared>>,
    worker: Option<JoinHandle<()>>,
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WsClient {
    /// client with default options
    pub fn new() -> Self {
        Self::with_config(WsConfig::default())
    }

    /// client with explicit options
    pub fn with_config(config: WsConfig) -> Self {
        Self {
            config,
            callbacks: Arc::new(Callbacks::default()),
            state: Arc::new(AtomicU8::new(ConnectionState::Closed.as_u8())),
            shared: None,
            worker: None,
        }
    }

    fn set_callback(&mut self, set: impl FnOnce(&mut Callbacks)) -> &mut Self {
        match Arc::get_mut(&mut self.callbacks) {
            Some(callbacks) => set(callbacks),
            None => tracing::warn!("callbacks are frozen while a connection is live"),
        }
        self
    }

    /// called once when the connection reaches open
    pub fn on_open(&mut self, cb: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.set_callback(|c| c.open = Some(Box::new(cb)))
    }

    /// called per received complete text message
    pub fn on_text(&mut self, cb: impl Fn(String) + Send + Sync + 'static) -> &mut Self {
        self.set_callback(|c| c.text = Some(Box::new(cb)))
    }

    /// called per received complete binary message
    pub fn on_binary(&mut self, cb: impl Fn(Bytes) + Send + Sync + 'static) -> &mut Self {
        self.set_callback(|c| c.binary = Some(Box::new(cb)))
    }

    /// called once when the connection reaches closed after having been open
    pub fn on_close(&mut self, cb: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.set_callback(|c| c.close = Some(Box::new(cb)))
    }

    /// called for failures the worker detects after open
    pub fn on_error(&mut self, cb: impl Fn(WsError) + Send + Sync + 'static) -> &mut Self {
        self.set_callback(|c| c.error = Some(Box::new(cb)))
    }

    /// current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// establish the connection and start the worker
    ///
    /// runs url parsing, tcp connect (tls when the scheme asks for it) and
    /// the upgrade handshake under one deadline; on success the state is
    /// open, `on_open` has been scheduled on the worker and frames flow
    pub fn connect(&mut self, url: &str) -> Result<(), WsError> {
        let closed = ConnectionState::Closed.as_u8();
        let connecting = ConnectionState::Connecting.as_u8();
        if self
            .state
            .compare_exchange(closed, connecting, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WsError::InvalidConnState(self.state()));
        }
        match self.do_connect(url) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared = None;
                self.worker = None;
                self.state
                    .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn do_connect(&mut self, url: &str) -> Result<(), WsError> {
        if self.config.transform.is_some() {
            // rsv1 is never negotiated here; refuse instead of emitting
            // frames the peer cannot interpret
            return Err(WsError::InvalidArgument(
                "payload transform configured but no compression extension is negotiated".into(),
            ));
        }
        let endpoint = Endpoint::parse(url)?;
        let deadline = Instant::now() + self.config.connect_timeout;
        let tcp = tcp_connect(&endpoint.host, endpoint.port, deadline)?;
        let stream = if endpoint.mode.is_secure() {
            WsStream::Tls(wrap_tls(tcp, &endpoint.host, deadline)?)
        } else {
            WsStream::Plain(tcp)
        };
        let transport = Transport::new(stream)?;
        let (resp, remain) = perform_handshake(
            &transport,
            &endpoint,
            &self.config.headers,
            &self.config.extensions,
            deadline,
        )?;
        tracing::debug!(status = %resp.status(), host = %endpoint.host, "connection open");

        let shared = Arc::new(Shared {
            transport,
            state: self.state.clone(),
            stop: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            pong_deadline: Mutex::new(None),
            pong_timeout: self.config.pong_timeout,
            callbacks: self.callbacks.clone(),
        });
        let _ = shared.cas_state(ConnectionState::Connecting, ConnectionState::Open);

        let worker_shared = shared.clone();
        let decoder = FrameDecoder::new(FrameConfig {
            mask_send_frame: true,
            max_frame_size: self.config.max_frame_size,
            check_rsv: true,
        });
        let heartbeat = self.config.heartbeat_interval;
        let worker = std::thread::Builder::new()
            .name("ws-link-worker".into())
            .spawn(move || worker_loop(worker_shared, decoder, heartbeat, remain))?;
        self.shared = Some(shared);
        self.worker = Some(worker);
        Ok(())
    }

    fn open_shared(&self) -> Result<&Arc<Shared>, WsError> {
        let shared = self
            .shared
            .as_ref()
            .ok_or(WsError::InvalidConnState(ConnectionState::Closed))?;
        let state = shared.state();
        if state != ConnectionState::Open {
            return Err(WsError::InvalidConnState(state));
        }
        Ok(shared)
    }

    /// send one unfragmented masked text frame
    pub fn send_text(&self, text: &str) -> Result<(), WsError> {
        let shared = self.open_shared()?;
        shared.send_frame(&Frame::text_frame(gen_mask(), text))
    }

    /// send one unfragmented masked binary frame
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        let shared = self.open_shared()?;
        shared.send_frame(&Frame::binary_frame(gen_mask(), data))
    }

    /// send a ping with up to 125 bytes of payload
    pub fn ping(&self, payload: &[u8]) -> Result<(), WsError> {
        if payload.len() > 125 {
            return Err(WsError::InvalidArgument(
                "control frame payload must be 125 bytes or fewer".into(),
            ));
        }
        let shared = self.open_shared()?;
        shared.send_frame(&Frame::ping_frame(gen_mask(), payload))?;
        shared.arm_pong_timer();
        Ok(())
    }

    /// tear the connection down
    ///
    /// initiates the closing handshake when open, joins the worker and
    /// closes the transport; idempotent, and `on_close` fires exactly once.
    /// safe to call from within a callback: the join is skipped on the
    /// worker thread and the worker unwinds once the callback returns
    pub fn disconnect(&mut self) {
        let Some(shared) = self.shared.take() else {
            self.state
                .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
            return;
        };
        if shared.cas_state(ConnectionState::Open, ConnectionState::Closing) {
            let _ = shared.send_frame(&Frame::close_frame(gen_mask(), 1000, b""));
        }
        shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            // a callback running on the worker thread may call back into
            // the client; joining from there would be a self-join
            if worker.thread().id() == std::thread::current().id() {
                drop(worker);
            } else {
                let _ = worker.join();
            }
        }
        shared.transport.close();
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        shared.emit_close_once();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Flow {
    Continue,
    Stop,
    Fail(WsError),
}

fn dispatch(shared: &Shared, frame: Frame) -> Flow {
    match frame.opcode() {
        OpCode::Text => match String::from_utf8(frame.into_payload().to_vec()) {
            Ok(text) => {
                shared.callbacks.emit_text(text);
                Flow::Continue
            }
            Err(_) => Flow::Fail(WsError::Protocol {
                close_code: 1007,
                error: ProtocolError::InvalidUtf8,
            }),
        },
        OpCode::Binary => {
            shared.callbacks.emit_binary(frame.into_payload().freeze());
            Flow::Continue
        }
        OpCode::Ping => {
            let pong = Frame::pong_frame(gen_mask(), frame.payload());
            match shared.send_frame(&pong) {
                Ok(()) => Flow::Continue,
                Err(e) => Flow::Fail(e),
            }
        }
        OpCode::Pong => {
            shared.clear_pong_timer();
            Flow::Continue
        }
        OpCode::Close => {
            if shared.cas_state(ConnectionState::Open, ConnectionState::Closing) {
                let echo = Frame::close_frame(gen_mask(), frame.close_code(), b"");
                let _ = shared.send_frame(&echo);
            }
            shared.stop.store(true, Ordering::SeqCst);
            Flow::Stop
        }
        other => Flow::Fail(WsError::Protocol {
            close_code: 1002,
            error: ProtocolError::UnsupportedFrame(other),
        }),
    }
}

fn worker_loop(shared: Arc<Shared>, mut decoder: FrameDecoder, heartbeat: Duration, seed: BytesMut) {
    shared.callbacks.emit_open();
    let mut recv_buf = seed;
    let mut tmp = [0u8; 8192];
    let mut last_ping = Instant::now();

    let failure: Option<WsError> = 'conn: loop {
        if shared.stop.load(Ordering::SeqCst) {
            break None;
        }
        if !heartbeat.is_zero()
            && shared.state() == ConnectionState::Open
            && last_ping.elapsed() >= heartbeat
        {
            if let Err(e) = shared.send_frame(&Frame::ping_frame(gen_mask(), b"")) {
                break Some(e);
            }
            shared.arm_pong_timer();
            last_ping = Instant::now();
        }
        if shared.pong_expired() {
            break Some(WsError::Timeout("pong wait".into()));
        }
        // drain everything already buffered before blocking again; the
        // handshake may have left whole frames behind the 101
        loop {
            match decoder.decode(&mut recv_buf) {
                Ok(Some(frame)) => match dispatch(&shared, frame) {
                    Flow::Continue => {}
                    Flow::Stop => break 'conn None,
                    Flow::Fail(e) => break 'conn Some(e),
                },
                Ok(None) => break,
                Err(error) => {
                    break 'conn Some(WsError::Protocol {
                        close_code: 1002,
                        error,
                    });
                }
            }
        }
        match shared.transport.recv_some(&mut tmp, SLICE_TIMEOUT) {
            Ok(SliceRead::Data(n)) => recv_buf.extend_from_slice(&tmp[..n]),
            Ok(SliceRead::Idle) => {}
            Ok(SliceRead::Eof) => {
                if shared.state() == ConnectionState::Closing || shared.stop.load(Ordering::SeqCst)
                {
                    break None;
                }
                break Some(WsError::ConnClosed);
            }
            Err(e) => {
                if shared.state() == ConnectionState::Closing || shared.stop.load(Ordering::SeqCst)
                {
                    break None;
                }
                break Some(e);
            }
        }
    };

    if let Some(err) = failure {
        tracing::debug!(error = %err, "worker terminating on failure");
        let close_code = match &err {
            WsError::Protocol { close_code, .. } => *close_code,
            _ => 1001,
        };
        if shared.cas_state(ConnectionState::Open, ConnectionState::Closing) {
            let _ = shared.send_frame(&Frame::close_frame(gen_mask(), close_code, b""));
        }
        shared.callbacks.emit_error(err);
    }
    shared.transport.close();
    shared
        .state
        .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
    shared.emit_close_once();
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopTransform;

    impl PayloadTransform for NoopTransform {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, WsError> {
            Ok(data.to_vec())
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, WsError> {
            Ok(data.to_vec())
        }
    }

    #[test]
    fn state_repr_round_trip() {
        for state in [
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn send_requires_open_state() {
        let client = WsClient::new();
        assert!(matches!(
            client.send_text("hi"),
            Err(WsError::InvalidConnState(ConnectionState::Closed))
        ));
        assert!(matches!(
            client.send_binary(b"hi"),
            Err(WsError::InvalidConnState(ConnectionState::Closed))
        ));
    }

    #[test]
    fn oversized_ping_payload_rejected() {
        let client = WsClient::new();
        let payload = vec![0u8; 126];
        assert!(matches!(
            client.ping(&payload),
            Err(WsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn bad_url_fails_fast() {
        let mut client = WsClient::new();
        assert!(matches!(
            client.connect("http://example.com/"),
            Err(WsError::InvalidUrl(_))
        ));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn transform_without_negotiation_rejected() {
        let mut client = WsClient::with_config(WsConfig {
            transform: Some(Arc::new(NoopTransform)),
            ..Default::default()
        });
        assert!(matches!(
            client.connect("ws://127.0.0.1:9/"),
            Err(WsError::InvalidArgument(_))
        ));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn disconnect_without_connection_is_a_noop() {
        let mut client = WsClient::new();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
