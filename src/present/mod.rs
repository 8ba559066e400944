//! Presentation of decoded frames and capture of local input.
//!
//! Each media kind owns a small queue drained by its own thread. Frames
//! arriving while that thread runs are queued, or dropped when the queue is
//! full; frames arriving while it doesn't are presented on the caller's
//! thread. Devices sit behind [`VideoRenderer`], [`AudioOutput`] and
//! [`InputSource`].

pub mod input;
pub mod pacing;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use ffmpeg_bus::{MediaFrame, MediaKind, Sink, Source, Worker};
use tokio_util::sync::CancellationToken;

use crate::protocol::Outbound;
use input::{INPUT_TICK, InputSnapshot, InputSource, capture_tick};
use pacing::{Pacer, RateCounter, adaptive_gap};

/// Frames waiting per kind before new ones are dropped.
pub const QUEUE_DEPTH: usize = 2;
/// Dequeue timeout of the presentation threads.
pub const QUEUE_POLL: Duration = Duration::from_millis(100);
/// Audio queued in the device beyond this many bytes is discarded
/// (20 ms of 48 kHz stereo f32, four times over).
pub const AUDIO_BACKLOG_LIMIT: usize = 20 * 48 * 2 * 4 * 4;

pub trait VideoRenderer<F>: Send {
    /// Called before a new video stream starts flowing.
    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn render(&mut self, frame: &F) -> anyhow::Result<()>;
    fn set_title(&mut self, title: &str);
}

pub trait AudioOutput<F>: Send {
    /// Called before a new audio stream starts flowing.
    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Bytes accepted but not yet played.
    fn queued_bytes(&self) -> usize;
    fn clear(&mut self);
    fn push(&mut self, frame: &F) -> anyhow::Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStats {
    pub presented: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub video: LaneStats,
    pub audio: LaneStats,
}

struct Queued<F> {
    frame: F,
    received: Instant,
}

struct Lane<F> {
    thread_name: &'static str,
    tx: Sender<Queued<F>>,
    rx: Receiver<Queued<F>>,
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
    /// Started by the owner and not stopped since; survives pause.
    wanted: AtomicBool,
    presented: AtomicU64,
    dropped: AtomicU64,
}

impl<F> Lane<F> {
    fn new(thread_name: &'static str) -> Self {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        Self {
            thread_name,
            tx,
            rx,
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            presented: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            presented: self.presented.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops and joins the thread, then discards whatever is still queued.
    fn halt(&self) {
        let worker = lock(&self.worker).take();
        self.running.store(false, Ordering::Release);
        if let Some(worker) = worker {
            worker.stop();
        }
        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            log::debug!("Present: discarded {} queued frames of {}", discarded, self.thread_name);
        }
    }
}

type SharedRenderer<F> = Arc<Mutex<Box<dyn VideoRenderer<F>>>>;
type SharedOutput<F> = Arc<Mutex<Box<dyn AudioOutput<F>>>>;

pub struct Presenter<F: MediaFrame> {
    video: Arc<Lane<F>>,
    audio: Arc<Lane<F>>,
    renderer: SharedRenderer<F>,
    output: SharedOutput<F>,
    input: Arc<Mutex<Box<dyn InputSource>>>,
    input_worker: Mutex<Option<Worker>>,
    commands: Arc<Source<String>>,
}

impl<F: MediaFrame> Presenter<F> {
    pub fn new(
        renderer: Box<dyn VideoRenderer<F>>,
        output: Box<dyn AudioOutput<F>>,
        input: Box<dyn InputSource>,
    ) -> Self {
        Self {
            video: Arc::new(Lane::new("present-video")),
            audio: Arc::new(Lane::new("present-audio")),
            renderer: Arc::new(Mutex::new(renderer)),
            output: Arc::new(Mutex::new(output)),
            input: Arc::new(Mutex::new(input)),
            input_worker: Mutex::new(None),
            commands: Arc::new(Source::new()),
        }
    }

    /// Input documents leave through here.
    pub fn commands(&self) -> &Source<String> {
        &self.commands
    }

    pub fn stats(&self) -> Stats {
        Stats {
            video: self.video.stats(),
            audio: self.audio.stats(),
        }
    }

    fn lane(&self, kind: MediaKind) -> &Arc<Lane<F>> {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    pub fn is_running(&self, kind: MediaKind) -> bool {
        self.lane(kind).is_running()
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.input_worker)
            .as_ref()
            .is_some_and(Worker::is_alive)
    }

    pub fn start_video(&self) -> anyhow::Result<()> {
        self.video.wanted.store(true, Ordering::Release);
        self.spawn(MediaKind::Video)
    }

    pub fn stop_video(&self) {
        self.video.wanted.store(false, Ordering::Release);
        self.video.halt();
    }

    pub fn start_audio(&self) -> anyhow::Result<()> {
        self.audio.wanted.store(true, Ordering::Release);
        self.spawn(MediaKind::Audio)
    }

    pub fn stop_audio(&self) {
        self.audio.wanted.store(false, Ordering::Release);
        self.audio.halt();
    }

    fn spawn(&self, kind: MediaKind) -> anyhow::Result<()> {
        let lane = self.lane(kind).clone();
        let mut worker = lock(&lane.worker);
        if worker.as_ref().is_some_and(Worker::is_alive) {
            return Ok(());
        }

        lane.running.store(true, Ordering::Release);
        let thread_lane = lane.clone();
        let spawned = match kind {
            MediaKind::Video => {
                let renderer = self.renderer.clone();
                Worker::spawn(lane.thread_name, move |cancel| {
                    video_loop(cancel, &thread_lane, &renderer)
                })
            }
            MediaKind::Audio => {
                let output = self.output.clone();
                Worker::spawn(lane.thread_name, move |cancel| {
                    audio_loop(cancel, &thread_lane, &output)
                })
            }
        };
        match spawned {
            Ok(spawned) => {
                *worker = Some(spawned);
                Ok(())
            }
            Err(e) => {
                lane.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Halts presentation of `kind` without forgetting that it was started.
    pub fn pause(&self, kind: MediaKind) {
        self.lane(kind).halt();
        if kind == MediaKind::Audio {
            let mut output = lock(&self.output);
            output.pause();
            output.clear();
        }
    }

    pub fn prepare(&self, kind: MediaKind) -> anyhow::Result<()> {
        match kind {
            MediaKind::Video => lock(&self.renderer).prepare(),
            MediaKind::Audio => lock(&self.output).prepare(),
        }
    }

    /// Restarts presentation of `kind` if it was running before [`pause`].
    ///
    /// [`pause`]: Presenter::pause
    pub fn resume(&self, kind: MediaKind) -> anyhow::Result<()> {
        if kind == MediaKind::Audio {
            lock(&self.output).resume();
        }
        if self.lane(kind).wanted.load(Ordering::Acquire) {
            self.spawn(kind)?;
        }
        Ok(())
    }

    pub fn start_input(&self) -> anyhow::Result<()> {
        let mut worker = lock(&self.input_worker);
        if worker.as_ref().is_some_and(Worker::is_alive) {
            return Ok(());
        }
        let source = self.input.clone();
        let commands = self.commands.clone();
        *worker = Some(Worker::spawn("input-capture", move |cancel| {
            input_loop(cancel, &source, &commands)
        })?);
        Ok(())
    }

    pub fn stop_input(&self) {
        let worker = lock(&self.input_worker).take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }

    fn present_inline(&self, frame: F) {
        let kind = frame.kind();
        let result = match kind {
            MediaKind::Video => lock(&self.renderer).render(&frame),
            MediaKind::Audio => play(&mut **lock(&self.output), &frame),
        };
        match result {
            Ok(()) => {
                self.lane(kind).presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("Present: {} frame failed: {}", kind, e),
        }
    }
}

impl<F: MediaFrame> Sink<F> for Presenter<F> {
    fn handle(&self, frame: F) {
        let lane = self.lane(frame.kind());
        if !lane.is_running() {
            self.present_inline(frame);
            return;
        }

        let queued = Queued {
            frame,
            received: Instant::now(),
        };
        match lane.tx.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(rejected)) | Err(TrySendError::Disconnected(rejected)) => {
                let dropped = lane.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "Present: {} queue full, frame dropped ({} so far)",
                    rejected.frame.kind(),
                    dropped
                );
            }
        }
    }
}

impl<F: MediaFrame> Drop for Presenter<F> {
    fn drop(&mut self) {
        self.stop_input();
        self.stop_video();
        self.stop_audio();
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn play<F>(output: &mut dyn AudioOutput<F>, frame: &F) -> anyhow::Result<()> {
    let queued = output.queued_bytes();
    if queued > AUDIO_BACKLOG_LIMIT {
        log::debug!("Present: audio backlog of {} bytes cleared", queued);
        output.clear();
    }
    output.push(frame)
}

fn next_queued<F>(cancel: &CancellationToken, lane: &Lane<F>) -> Option<Option<Queued<F>>> {
    if cancel.is_cancelled() {
        return None;
    }
    match lane.rx.recv_timeout(QUEUE_POLL) {
        Ok(queued) => Some(Some(queued)),
        Err(RecvTimeoutError::Timeout) => Some(None),
        Err(RecvTimeoutError::Disconnected) => None,
    }
}

fn video_loop<F: MediaFrame>(
    cancel: CancellationToken,
    lane: &Lane<F>,
    renderer: &Mutex<Box<dyn VideoRenderer<F>>>,
) {
    log::info!("Present: video thread started");
    let mut pacer = Pacer::new();
    let mut rate = RateCounter::new(Instant::now());

    while let Some(next) = next_queued(&cancel, lane) {
        let Some(queued) = next else { continue };
        let frame = &queued.frame;

        let wait = pacer.delay(frame.pts_ms(), frame.duration_ms(), Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }

        {
            let mut renderer = lock(renderer);
            match renderer.render(frame) {
                Ok(()) => {
                    lane.presented.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::warn!("Present: render failed: {}", e),
            }
            let now = Instant::now();
            let latency = now.saturating_duration_since(queued.received);
            if let Some(report) = rate.record(latency, now) {
                renderer.set_title(&report.title());
            }
        }
        drop(queued);

        thread::sleep(adaptive_gap(lane.rx.len()));
    }
    log::info!("Present: video thread exited");
}

fn audio_loop<F: MediaFrame>(
    cancel: CancellationToken,
    lane: &Lane<F>,
    output: &Mutex<Box<dyn AudioOutput<F>>>,
) {
    log::info!("Present: audio thread started");
    while let Some(next) = next_queued(&cancel, lane) {
        let Some(queued) = next else { continue };
        match play(&mut **lock(output), &queued.frame) {
            Ok(()) => {
                lane.presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("Present: audio push failed: {}", e),
        }
    }
    log::info!("Present: audio thread exited");
}

fn input_loop(
    cancel: CancellationToken,
    source: &Mutex<Box<dyn InputSource>>,
    commands: &Source<String>,
) {
    log::info!("Present: input capture started");
    let mut snapshot = InputSnapshot::new();
    let mut next_tick = Instant::now();

    while !cancel.is_cancelled() {
        let message = {
            let mut source = lock(source);
            capture_tick(&mut snapshot, &mut **source, Instant::now())
        };
        if let Some(message) = message {
            match Outbound::Input(message).to_json() {
                Ok(document) => {
                    commands.forward(document);
                }
                Err(e) => log::warn!("Present: couldn't encode input: {}", e),
            }
        }

        next_tick += INPUT_TICK;
        let now = Instant::now();
        match next_tick.checked_duration_since(now) {
            Some(wait) => thread::sleep(wait),
            None => next_tick = now,
        }
    }
    log::info!("Present: input capture exited");
}
