//! Media ingestion: a receive stage reads packets and feeds the decoder, a
//! drain stage pulls decoded frames out and forwards them.
//!
//! Both stages share the decoder behind one mutex. The drain stage sleeps on
//! a condition variable that the receive stage signals after every submitted
//! packet, so neither stage busy-waits on the other.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    decoder::Decoder,
    error::{BusError, DecodeError},
    fanout::{Observers, Source},
    frame::RawFrame,
    input::{AvInput, Interrupt},
    packet::RawPacket,
    stream::MediaKind,
    worker::Worker,
};

/// Upper bound on a drain-stage wait, so cancellation is observed promptly.
pub const DRAIN_WAIT: Duration = Duration::from_millis(100);

pub trait StreamPacket {
    fn stream_index(&self) -> usize;
}

pub trait PacketReader: Send + 'static {
    type Packet;

    /// Blocks until the next packet arrives or the transport fails.
    fn read_packet(&mut self) -> Result<Self::Packet, BusError>;
}

pub trait FrameDecoder: Send + 'static {
    type Packet;
    type Frame;

    fn send_packet(&mut self, packet: &Self::Packet) -> Result<(), DecodeError>;
    fn send_eof(&mut self) -> Result<(), DecodeError>;
    fn receive_frame(&mut self) -> Result<Self::Frame, DecodeError>;
}

/// A transport reader and decoder opened for one descriptor.
pub struct Opened<R, D> {
    pub reader: R,
    pub decoder: D,
    pub stream_index: usize,
}

/// Opens transports and decoders for a pipeline.
pub trait MediaBackend: Send + Sync + 'static {
    type Packet: StreamPacket + Send + 'static;
    type Frame: Clone + Send + 'static;
    type Reader: PacketReader<Packet = Self::Packet>;
    type Decoder: FrameDecoder<Packet = Self::Packet, Frame = Self::Frame>;

    /// Blocking reads on the returned reader must give up once `interrupt`
    /// is raised.
    fn open(
        &self,
        descriptor: &str,
        kind: MediaKind,
        interrupt: Interrupt,
    ) -> Result<Opened<Self::Reader, Self::Decoder>, BusError>;
}

/// FFmpeg demuxer plus decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    type Packet = RawPacket;
    type Frame = RawFrame;
    type Reader = AvInput;
    type Decoder = Decoder;

    fn open(
        &self,
        descriptor: &str,
        kind: MediaKind,
        interrupt: Interrupt,
    ) -> Result<Opened<AvInput, Decoder>, BusError> {
        let reader = AvInput::open(descriptor, kind, interrupt)?;
        let decoder = Decoder::new(reader.stream())?;
        Ok(Opened {
            stream_index: reader.stream().index(),
            reader,
            decoder,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    /// Opened and ready to start.
    Initialized,
    Running,
    Stopping,
    /// Stages joined and decoder flushed; needs `init` before the next start.
    Stopped,
}

struct DecoderSlot<D> {
    decoder: Mutex<D>,
    submitted: Condvar,
}

impl<D> DecoderSlot<D> {
    fn lock(&self) -> MutexGuard<'_, D> {
        self.decoder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MediaContext<B: MediaBackend> {
    descriptor: String,
    stream_index: usize,
    active: bool,
    reader: Arc<Mutex<B::Reader>>,
    decoder: Arc<DecoderSlot<B::Decoder>>,
    interrupt: Interrupt,
}

struct Inner<B: MediaBackend> {
    state: PipelineState,
    context: Option<MediaContext<B>>,
    receive: Option<Worker>,
    drain: Option<Worker>,
}

pub struct Pipeline<B: MediaBackend> {
    name: String,
    kind: MediaKind,
    backend: B,
    packets: Arc<Observers<B::Packet>>,
    frames: Arc<Source<B::Frame>>,
    inner: Mutex<Inner<B>>,
}

impl<B: MediaBackend> Pipeline<B> {
    pub fn new(name: &str, kind: MediaKind, backend: B) -> Self {
        Self {
            name: name.to_string(),
            kind,
            backend,
            packets: Arc::new(Observers::new()),
            frames: Arc::new(Source::new()),
            inner: Mutex::new(Inner {
                state: PipelineState::Uninitialized,
                context: None,
                receive: None,
                drain: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Observers see every packet before it is handed to the decoder.
    pub fn packets(&self) -> &Observers<B::Packet> {
        &self.packets
    }

    /// Every decoded frame is forwarded here, in decode order.
    pub fn frames(&self) -> &Source<B::Frame> {
        &self.frames
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PipelineState {
        let inner = self.lock();
        if inner.state == PipelineState::Running && !Self::all_alive(&inner) {
            // A stage gave up on a run error; no further frames can arrive.
            return PipelineState::Stopped;
        }
        inner.state
    }

    pub fn descriptor(&self) -> Option<String> {
        self.lock().context.as_ref().map(|c| c.descriptor.clone())
    }

    pub fn is_receiving(&self) -> bool {
        self.lock().receive.as_ref().is_some_and(Worker::is_alive)
    }

    pub fn is_draining(&self) -> bool {
        self.lock().drain.as_ref().is_some_and(Worker::is_alive)
    }

    fn all_alive(inner: &Inner<B>) -> bool {
        inner.receive.as_ref().is_some_and(Worker::is_alive)
            && inner.drain.as_ref().is_some_and(Worker::is_alive)
    }

    fn any_alive(inner: &Inner<B>) -> bool {
        inner.receive.as_ref().is_some_and(Worker::is_alive)
            || inner.drain.as_ref().is_some_and(Worker::is_alive)
    }

    /// Opens `descriptor`, replacing any previous context.
    ///
    /// Stages must be stopped first; a pipeline with live stages refuses.
    pub fn init(&self, descriptor: &str) -> Result<(), BusError> {
        let mut inner = self.lock();
        if Self::any_alive(&inner) {
            return Err(BusError::init_fail(format!(
                "{}: stages still running, stop before init",
                self.name
            )));
        }
        inner.receive = None;
        inner.drain = None;
        inner.context = None;
        inner.state = PipelineState::Initializing;
        log::info!("{}: initializing from {}", self.name, descriptor);

        let interrupt = Interrupt::new();
        match self.backend.open(descriptor, self.kind, interrupt.clone()) {
            Ok(opened) => {
                inner.context = Some(MediaContext {
                    descriptor: descriptor.to_string(),
                    stream_index: opened.stream_index,
                    active: true,
                    reader: Arc::new(Mutex::new(opened.reader)),
                    decoder: Arc::new(DecoderSlot {
                        decoder: Mutex::new(opened.decoder),
                        submitted: Condvar::new(),
                    }),
                    interrupt,
                });
                inner.state = PipelineState::Initialized;
                log::info!(
                    "{}: initialized, stream index {}",
                    self.name,
                    opened.stream_index
                );
                Ok(())
            }
            Err(e) => {
                inner.state = PipelineState::Uninitialized;
                log::error!("{}: init failed: {}", self.name, e);
                Err(match e {
                    BusError::InitFail(_) => e,
                    other => BusError::init_fail(other.to_string()),
                })
            }
        }
    }

    /// Launches the drain stage, then the receive stage. A live stage is
    /// left alone.
    pub fn start(&self) -> Result<(), BusError> {
        let mut inner = self.lock();
        let Some(context) = inner.context.as_ref().filter(|c| c.active) else {
            return Err(BusError::NotInitialized);
        };
        context.interrupt.clear();
        let stream_index = context.stream_index;
        let reader = context.reader.clone();
        let slot = context.decoder.clone();

        if !inner.drain.as_ref().is_some_and(Worker::is_alive) {
            let name = self.name.clone();
            let frames = self.frames.clone();
            let slot = slot.clone();
            let worker = Worker::spawn(&format!("{}-drain", self.name), move |cancel| {
                drain_loop(&name, cancel, slot, frames)
            })
            .map_err(|e| BusError::run_error(format!("can't spawn drain thread: {}", e)))?;
            inner.drain = Some(worker);
        }

        if !inner.receive.as_ref().is_some_and(Worker::is_alive) {
            let name = self.name.clone();
            let packets = self.packets.clone();
            let worker = Worker::spawn(&format!("{}-receive", self.name), move |cancel| {
                receive_loop(&name, cancel, reader, stream_index, packets, slot)
            })
            .map_err(|e| BusError::run_error(format!("can't spawn receive thread: {}", e)))?;
            inner.receive = Some(worker);
        }

        inner.state = PipelineState::Running;
        Ok(())
    }

    /// Cancels and joins both stages, then flushes the decoder. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.lock();
        let receive = inner.receive.take();
        let drain = inner.drain.take();
        if receive.is_some() || drain.is_some() {
            inner.state = PipelineState::Stopping;
            log::info!("{}: stopping", self.name);
            for worker in receive.iter().chain(drain.iter()) {
                worker.cancel();
            }
            if let Some(context) = inner.context.as_ref() {
                context.interrupt.raise();
                context.decoder.submitted.notify_all();
            }
            for worker in [receive, drain].into_iter().flatten() {
                worker.stop();
            }
        }
        self.flush_locked(&mut inner);
        if inner.context.is_some() {
            inner.state = PipelineState::Stopped;
        }
    }

    /// Drains every frame still buffered in the decoder through `frames()`.
    ///
    /// Does nothing while a stage is alive or when nothing was initialized.
    pub fn flush(&self) {
        let mut inner = self.lock();
        self.flush_locked(&mut inner);
    }

    fn flush_locked(&self, inner: &mut Inner<B>) {
        if Self::any_alive(inner) {
            log::info!("{}: flush skipped, stages still running", self.name);
            return;
        }
        let Some(context) = inner.context.as_mut().filter(|c| c.active) else {
            log::debug!("{}: flush skipped, not initialized", self.name);
            return;
        };
        context.active = false;

        let mut decoder = context.decoder.lock();
        if let Err(e) = decoder.send_eof() {
            log::warn!("{}: error when sending eof to decoder: {}", self.name, e);
        }
        let mut flushed = 0usize;
        loop {
            match decoder.receive_frame() {
                Ok(frame) => {
                    self.frames.forward(frame);
                    flushed += 1;
                }
                Err(DecodeError::Eof) | Err(DecodeError::Again) => break,
                Err(e) => {
                    log::warn!("{}: error when flushing decoder: {}", self.name, e);
                    break;
                }
            }
        }
        log::info!("{}: flushed {} frames", self.name, flushed);
    }
}

impl<B: MediaBackend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop<R, D>(
    name: &str,
    cancel: CancellationToken,
    reader: Arc<Mutex<R>>,
    stream_index: usize,
    packets: Arc<Observers<R::Packet>>,
    slot: Arc<DecoderSlot<D>>,
) where
    R: PacketReader,
    R::Packet: StreamPacket,
    D: FrameDecoder<Packet = R::Packet>,
{
    log::info!("{}: receive thread started", name);
    let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
    match receive(name, &cancel, &mut *reader, stream_index, &packets, &slot) {
        Ok(()) => {}
        Err(e) if cancel.is_cancelled() => log::debug!("{}: receive interrupted: {}", name, e),
        Err(e) => log::error!("{}: {}", name, e),
    }
    log::info!("{}: receive thread exited", name);
}

fn receive<R, D>(
    name: &str,
    cancel: &CancellationToken,
    reader: &mut R,
    stream_index: usize,
    packets: &Observers<R::Packet>,
    slot: &DecoderSlot<D>,
) -> Result<(), BusError>
where
    R: PacketReader,
    R::Packet: StreamPacket,
    D: FrameDecoder<Packet = R::Packet>,
{
    while !cancel.is_cancelled() {
        let packet = reader.read_packet()?;
        if packet.stream_index() != stream_index {
            return Err(BusError::run_error(format!(
                "wrong stream index {} (expected {})",
                packet.stream_index(),
                stream_index
            )));
        }
        packets.notify(&packet);

        let sent = slot.lock().send_packet(&packet);
        slot.submitted.notify_all();
        match sent {
            Ok(()) => {}
            Err(DecodeError::Again) => log::debug!("{}: decoder busy, packet dropped", name),
            Err(e) => {
                return Err(BusError::run_error(format!(
                    "error when sending packet to decoder: {}",
                    e
                )));
            }
        }
    }
    Ok(())
}

fn drain_loop<D: FrameDecoder>(
    name: &str,
    cancel: CancellationToken,
    slot: Arc<DecoderSlot<D>>,
    frames: Arc<Source<D::Frame>>,
) where
    D::Frame: Clone,
{
    log::info!("{}: drain thread started", name);
    if let Err(e) = drain(&cancel, &slot, &frames) {
        log::error!("{}: {}", name, e);
    }
    log::info!("{}: drain thread exited", name);
}

fn drain<D: FrameDecoder>(
    cancel: &CancellationToken,
    slot: &DecoderSlot<D>,
    frames: &Source<D::Frame>,
) -> Result<(), BusError>
where
    D::Frame: Clone,
{
    while !cancel.is_cancelled() {
        let mut decoder = slot.lock();
        let received = loop {
            match decoder.receive_frame() {
                Err(DecodeError::Again) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    decoder = slot
                        .submitted
                        .wait_timeout(decoder, DRAIN_WAIT)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
                other => break other,
            }
        };
        drop(decoder);

        match received {
            Ok(frame) => {
                frames.forward(frame);
            }
            Err(DecodeError::Eof) => {
                return Err(BusError::run_error("decoder reached end of stream"));
            }
            Err(e) => {
                return Err(BusError::run_error(format!(
                    "error when receiving frame from decoder: {}",
                    e
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
