use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

use crate::errors::WsError;

/// bound on a fully stalled write before the link is declared dead
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// plain tcp or tls wrapped stream
pub enum WsStream {
    /// cleartext tcp
    Plain(TcpStream),
    /// tls client session over tcp
    Tls(StreamOwned<ClientConnection, TcpStream>),
}

impl WsStream {
    /// borrow the underlying tcp socket
    pub fn tcp(&self) -> &TcpStream {
        match self {
            WsStream::Plain(s) => s,
            WsStream::Tls(tls) => &tls.sock,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, WsStream::Tls(_))
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf),
            WsStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.write(buf),
            WsStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WsStream::Plain(s) => s.flush(),
            WsStream::Tls(s) => s.flush(),
        }
    }
}

/// resolve `host:port` and connect the first reachable candidate within
/// the deadline
pub(crate) fn tcp_connect(host: &str, port: u16, deadline: Instant) -> Result<TcpStream, WsError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| WsError::ConnectionFailed(format!("resolve {host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(WsError::ConnectionFailed(format!("no address for {host}")));
    }
    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WsError::Timeout("tcp connect".into()));
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                tracing::debug!(%addr, "tcp connection established");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
            Err(WsError::Timeout("tcp connect".into()))
        }
        Some(e) => Err(WsError::ConnectionFailed(e.to_string())),
        None => Err(WsError::ConnectionFailed(format!("no address for {host}"))),
    }
}

/// run the tls client handshake over an established socket, sni taken from
/// the peer host
pub(crate) fn wrap_tls(
    stream: TcpStream,
    host: &str,
    deadline: Instant,
) -> Result<StreamOwned<ClientConnection, TcpStream>, WsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| WsError::TlsFailed(format!("invalid sni host {host}: {e}")))?;
    let mut conn = ClientConnection::new(Arc::new(config), name)
        .map_err(|e| WsError::TlsFailed(e.to_string()))?;
    let mut stream = stream;
    while conn.is_handshaking() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WsError::Timeout("tls handshake".into()));
        }
        stream
            .set_read_timeout(Some(remaining))
            .map_err(|e| WsError::TlsFailed(e.to_string()))?;
        stream
            .set_write_timeout(Some(remaining))
            .map_err(|e| WsError::TlsFailed(e.to_string()))?;
        match conn.complete_io(&mut stream) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(WsError::Timeout("tls handshake".into()));
            }
            Err(e) => return Err(WsError::TlsFailed(e.to_string())),
        }
    }
    tracing::debug!("tls connection established");
    Ok(StreamOwned::new(conn, stream))
}

/// outcome of one bounded receive slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceRead {
    /// bytes were read
    Data(usize),
    /// the slice elapsed without data
    Idle,
    /// orderly end of stream from the peer
    Eof,
}

/// connection transport: one stream, readiness probing and serialized writes
///
/// the stream itself sits behind a mutex so that pongs and close frames
/// emitted by the worker never interleave with user sends. the worker
/// waits for readability on a duplicate socket handle outside the lock,
/// keeping writers unblocked during idle slices.
pub(crate) struct Transport {
    stream: Mutex<WsStream>,
    sock: TcpStream,
    tls: bool,
    // plaintext may remain buffered in the tls session after a full read
    tls_pending: AtomicBool,
}

impl Transport {
    pub(crate) fn new(stream: WsStream) -> Result<Self, WsError> {
        let sock = stream
            .tcp()
            .try_clone()
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        // writes must stay bounded even for the shutdown close_notify
        sock.set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let tls = stream.is_tls();
        Ok(Self {
            stream: Mutex::new(stream),
            sock,
            tls,
            tls_pending: AtomicBool::new(false),
        })
    }

    fn lock_stream(&self) -> MutexGuard<'_, WsStream> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// write every byte of `bytes` under one deadline, retrying transient
    /// want-read/want-write conditions on the tls path
    ///
    /// the socket carries a send timeout, so a peer that stops reading
    /// surfaces as a timeout here instead of parking the thread in the
    /// kernel with the stream lock held
    pub(crate) fn send_all(&self, bytes: &[u8]) -> Result<(), WsError> {
        let deadline = Instant::now() + WRITE_TIMEOUT;
        self.sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let mut stream = self.lock_stream();
        let mut rest = bytes;
        while !rest.is_empty() {
            match stream.write(rest) {
                Ok(0) => {
                    return Err(WsError::ConnectionFailed("write returned zero".into()));
                }
                Ok(n) => rest = &rest[n..],
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut
                        || e.kind() == ErrorKind::Interrupted =>
                {
                    self.rearm_write_timeout(deadline)?;
                }
                Err(e) => return Err(WsError::ConnectionFailed(e.to_string())),
            }
        }
        loop {
            match stream.flush() {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut
                        || e.kind() == ErrorKind::Interrupted =>
                {
                    self.rearm_write_timeout(deadline)?;
                }
                Err(e) => return Err(WsError::ConnectionFailed(e.to_string())),
            }
        }
    }

    fn rearm_write_timeout(&self, deadline: Instant) -> Result<(), WsError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WsError::Timeout("transport write".into()));
        }
        self.sock.set_write_timeout(Some(remaining))?;
        Ok(())
    }

    /// wait up to `timeout` for readability, then read what is available
    ///
    /// readiness is probed on the duplicate handle without taking the
    /// stream lock, so a sender is only ever blocked while bytes are
    /// actually being drained
    pub(crate) fn recv_some(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<SliceRead, WsError> {
        self.sock.set_read_timeout(Some(timeout))?;
        if !(self.tls && self.tls_pending.load(Ordering::Relaxed)) {
            let mut probe = [0u8; 1];
            match self.sock.peek(&mut probe) {
                // fall through on eof as well: the tls session may still
                // hold undelivered plaintext
                Ok(_) => {}
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut
                        || e.kind() == ErrorKind::Interrupted =>
                {
                    return Ok(SliceRead::Idle);
                }
                Err(e) => return Err(WsError::ConnectionFailed(e.to_string())),
            }
        }
        let mut stream = self.lock_stream();
        match stream.read(buf) {
            Ok(0) => Ok(SliceRead::Eof),
            Ok(n) => {
                if self.tls {
                    self.tls_pending.store(n == buf.len(), Ordering::Relaxed);
                }
                Ok(SliceRead::Data(n))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(SliceRead::Eof),
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::Interrupted =>
            {
                self.tls_pending.store(false, Ordering::Relaxed);
                Ok(SliceRead::Idle)
            }
            Err(e) => Err(WsError::ConnectionFailed(e.to_string())),
        }
    }

    /// best-effort shutdown, idempotent
    pub(crate) fn close(&self) {
        let mut stream = self.lock_stream();
        if let WsStream::Tls(tls) = &mut *stream {
            tls.conn.send_close_notify();
            let _ = tls.conn.write_tls(&mut tls.sock);
        }
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}
