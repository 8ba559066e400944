//! Control channel to the remote peer.
//!
//! A reliable TCP stream carries commands in both directions; a UDP socket
//! connected to the same peer carries input events out and telemetry in.
//! Every outbound write goes through one lock, which also tracks when the
//! peer last heard from us so keepalives are only sent on a quiet line.

mod dispatch;
mod reassembly;

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use ffmpeg_bus::{Sink, Worker};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use dispatch::{Dispatched, Dispatcher, Reconfigure};
pub use reassembly::Reassembler;

use crate::protocol::Outbound;

/// The peer drops us after this long without traffic.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// TCP read timeout of the listen loop.
pub const LISTEN_POLL: Duration = Duration::from_millis(100);
const DATAGRAM_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel init failed: {0}")]
    InitFail(String),
    #[error("control channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

struct Outbox {
    tcp: TcpStream,
    udp: UdpSocket,
    last_sent: Instant,
}

/// Serializes every outbound write.
#[derive(Default)]
struct Sender {
    outbox: Mutex<Option<Outbox>>,
}

impl Sender {
    fn lock(&self) -> MutexGuard<'_, Option<Outbox>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tcp(&self, bytes: &[u8]) -> Result<(), ControlError> {
        let mut outbox = self.lock();
        let outbox = outbox.as_mut().ok_or(ControlError::NotConnected)?;
        outbox.last_sent = Instant::now();
        outbox.tcp.write_all(bytes)?;
        Ok(())
    }

    fn send_udp(&self, bytes: &[u8]) -> Result<(), ControlError> {
        let mut outbox = self.lock();
        let outbox = outbox.as_mut().ok_or(ControlError::NotConnected)?;
        outbox.last_sent = Instant::now();
        outbox.udp.send(bytes)?;
        Ok(())
    }

    /// Sends a keepalive if nothing went out for `interval`, otherwise
    /// returns how long the line may stay quiet.
    fn keepalive_due(&self, interval: Duration, keepalive: &[u8]) -> Option<Duration> {
        let mut outbox = self.lock();
        let outbox = outbox.as_mut()?;
        let elapsed = outbox.last_sent.elapsed();
        if elapsed < interval {
            return Some(interval - elapsed);
        }
        outbox.last_sent = Instant::now();
        if let Err(e) = outbox.tcp.write_all(keepalive) {
            log::warn!("Control: keepalive failed: {}", e);
        }
        Some(interval)
    }
}

struct Workers {
    listen: Option<Worker>,
    keepalive: Option<Worker>,
}

pub struct ControlChannel {
    dispatcher: Arc<Dispatcher>,
    sender: Arc<Sender>,
    readers: Mutex<Option<(TcpStream, UdpSocket)>>,
    workers: Mutex<Workers>,
}

impl ControlChannel {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            sender: Arc::new(Sender::default()),
            readers: Mutex::new(None),
            workers: Mutex::new(Workers {
                listen: None,
                keepalive: None,
            }),
        }
    }

    /// Binds both sockets to `local_port` and connects them to the peer.
    /// Previous sockets are closed.
    pub fn init(&self, remote: SocketAddr, local_port: u16) -> Result<(), ControlError> {
        let local_ip = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let local = SocketAddr::new(local_ip, local_port);

        let tcp: TcpStream = bind_and_connect(Type::STREAM, Protocol::TCP, local, remote)
            .map_err(|e| ControlError::InitFail(format!("tcp connect to {}: {}", remote, e)))?
            .into();
        let udp: UdpSocket = bind_and_connect(Type::DGRAM, Protocol::UDP, local, remote)
            .map_err(|e| ControlError::InitFail(format!("udp connect to {}: {}", remote, e)))?
            .into();

        let setup = || -> io::Result<(TcpStream, UdpSocket)> {
            tcp.set_nodelay(true)?;
            let tcp_reader = tcp.try_clone()?;
            tcp_reader.set_read_timeout(Some(LISTEN_POLL))?;
            let udp_reader = udp.try_clone()?;
            udp_reader.set_nonblocking(true)?;
            Ok((tcp_reader, udp_reader))
        };
        let readers = setup().map_err(|e| ControlError::InitFail(e.to_string()))?;

        *self.readers.lock().unwrap_or_else(PoisonError::into_inner) = Some(readers);
        *self.sender.lock() = Some(Outbox {
            tcp,
            udp,
            last_sent: Instant::now(),
        });
        log::info!("Control: connected to {} from port {}", remote, local_port);
        Ok(())
    }

    /// Starts the listen and keepalive threads. Running threads are kept.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        if !workers.listen.as_ref().is_some_and(Worker::is_alive) {
            let (tcp, udp) = {
                let readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
                let (tcp, udp) = readers.as_ref().ok_or(ControlError::NotConnected)?;
                (tcp.try_clone()?, udp.try_clone()?)
            };
            let dispatcher = self.dispatcher.clone();
            workers.listen = Some(Worker::spawn("control-listen", move |cancel| {
                listen_loop(cancel, tcp, udp, &dispatcher)
            })?);
        }

        if !workers.keepalive.as_ref().is_some_and(Worker::is_alive) {
            let sender = self.sender.clone();
            workers.keepalive = Some(Worker::spawn("control-keepalive", move |cancel| {
                keepalive_loop(cancel, &sender)
            })?);
        }
        Ok(())
    }

    /// Stops and joins both threads. Idempotent.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in [workers.listen.take(), workers.keepalive.take()]
            .into_iter()
            .flatten()
        {
            worker.stop();
        }
    }

    pub fn is_listening(&self) -> bool {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.listen.as_ref().is_some_and(Worker::is_alive)
    }

    /// Writes a document on the reliable stream.
    pub fn write_command(&self, document: &str) -> Result<(), ControlError> {
        self.sender.write_tcp(document.as_bytes())
    }

    pub fn send(&self, message: &Outbound) -> Result<(), ControlError> {
        self.write_command(&message.to_json()?)
    }

    /// Sends a document on the unreliable socket.
    pub fn send_datagram(&self, document: &str) -> Result<(), ControlError> {
        self.sender.send_udp(document.as_bytes())
    }
}

impl Sink<String> for ControlChannel {
    fn handle(&self, document: String) {
        if let Err(e) = self.send_datagram(&document) {
            log::warn!("Control: couldn't send input: {}", e);
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_and_connect(
    ty: Type,
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(remote), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(local))?;
    socket.connect(&SockAddr::from(remote))?;
    Ok(socket)
}

fn listen_loop(
    cancel: CancellationToken,
    mut tcp: TcpStream,
    udp: UdpSocket,
    dispatcher: &Dispatcher,
) {
    log::info!("Control: listen thread started");
    let mut window = Reassembler::new();
    let mut datagram = vec![0u8; DATAGRAM_SIZE];

    while !cancel.is_cancelled() {
        loop {
            match udp.recv(&mut datagram) {
                Ok(n) => log::debug!(
                    "Control: telemetry ({} bytes): {}",
                    n,
                    String::from_utf8_lossy(&datagram[..n])
                ),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Control: udp receive: {}", e);
                    break;
                }
            }
        }

        match tcp.read(window.spare()) {
            Ok(0) => {
                log::warn!("Control: connection closed by peer");
                break;
            }
            Ok(n) => {
                window.commit(n);
                while let Some(message) = window.next_message() {
                    dispatcher.dispatch(&message);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                log::error!("Control: read failed: {}", e);
                break;
            }
        }
    }
    log::info!("Control: listen thread exited");
}

fn keepalive_loop(cancel: CancellationToken, sender: &Sender) {
    log::info!("Control: keepalive thread started");
    let keepalive = match Outbound::KeepAlive.to_json() {
        Ok(json) => json,
        Err(e) => {
            log::error!("Control: can't encode keepalive: {}", e);
            return;
        }
    };
    while !cancel.is_cancelled() {
        let quiet = sender
            .keepalive_due(KEEPALIVE_INTERVAL, keepalive.as_bytes())
            .unwrap_or(KEEPALIVE_INTERVAL);
        // Woken early by stop.
        thread::park_timeout(quiet);
    }
    log::info!("Control: keepalive thread exited");
}
