//! TCP server: accept loop and per-connection workers.
//!
//! Each connection carries exactly one framed request and one framed
//! response, then closes. The accept loop is non-blocking so shutdown
//! is prompt; connections past the cap get a best-effort busy response.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::daemon::handlers::Handlers;
use crate::error::ErrorKind;
use crate::proto::frame::{FrameReader, FrameWriter};
use crate::proto::message::Message;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub tcp_port: u16,
    pub io_deadline: Duration,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl BoundServer {
    /// Binds without accepting; the daemon needs the bound port before
    /// it can wire up the other services.
    pub fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.tcp_port))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(self, handlers: Arc<Handlers>) -> std::io::Result<ServerHandle> {
        self.listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let local_addr = self.local_addr;
        let join = thread::Builder::new()
            .name("tcp-accept".to_string())
            .spawn(move || run_accept_loop(self.listener, self.config, handlers, accept_shutdown))?;
        tracing::info!(%local_addr, "tcp server listening");
        Ok(ServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    handlers: Arc<Handlers>,
    shutdown: Arc<AtomicBool>,
) {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, remote)) => {
                if let Some(guard) = ConnectionGuard::try_acquire(&active, config.max_connections) {
                    let handlers = Arc::clone(&handlers);
                    let config = config.clone();
                    let _ = thread::Builder::new()
                        .name("tcp-conn".to_string())
                        .spawn(move || {
                            handle_connection(stream, remote, &config, &handlers);
                            drop(guard);
                        });
                } else {
                    refuse_busy(stream, &config, &handlers);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn refuse_busy(stream: TcpStream, config: &ServerConfig, handlers: &Handlers) {
    let response = Message::error_response(
        "error",
        ErrorKind::Unavailable,
        "connection limit reached",
        &handlers.node_id,
    );
    if let Ok(sealed) = response.seal()
        && let Ok(bytes) = sealed.to_bytes()
    {
        let mut writer = FrameWriter::new(stream, config.max_frame_bytes);
        let _ = writer.write_frame(&bytes);
    }
}

fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    config: &ServerConfig,
    handlers: &Handlers,
) {
    if let Err(err) = serve_one(stream, remote, config, handlers) {
        tracing::debug!(%remote, "connection error: {err}");
    }
}

fn serve_one(
    stream: TcpStream,
    remote: SocketAddr,
    config: &ServerConfig,
    handlers: &Handlers,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(config.io_deadline))?;
    stream.set_write_timeout(Some(config.io_deadline))?;
    stream.set_nodelay(true)?;

    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::new(reader_stream, config.max_frame_bytes);
    let mut writer = FrameWriter::new(stream, config.max_frame_bytes);

    let response = match reader.read_next() {
        Ok(Some(bytes)) => match Message::from_slice(&bytes) {
            Ok(msg) => handlers.handle(msg, remote),
            Err(err) => {
                tracing::debug!(%remote, "malformed message: {err}");
                best_effort_error(err.kind(), &err, handlers)
            }
        },
        // Client connected and closed without sending; nothing owed.
        Ok(None) => return Ok(()),
        Err(err) => {
            tracing::debug!(%remote, "frame read failed: {err}");
            best_effort_error(err.kind(), &err, handlers)
        }
    };

    match response.to_bytes() {
        Ok(bytes) => {
            let _ = writer.write_frame(&bytes);
        }
        Err(err) => tracing::error!("response encode failed: {err}"),
    }
    Ok(())
}

fn best_effort_error(kind: ErrorKind, err: &dyn std::fmt::Display, handlers: &Handlers) -> Message {
    let response = Message::error_response("error", kind, err, &handlers.node_id);
    match response.clone().seal() {
        Ok(sealed) => sealed,
        Err(_) => response,
    }
}
