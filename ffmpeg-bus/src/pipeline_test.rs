use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{BusError, DecodeError};
use crate::fanout::{Observer, Sink};
use crate::input::Interrupt;
use crate::pipeline::{
    FrameDecoder, MediaBackend, Opened, PacketReader, Pipeline, PipelineState, StreamPacket,
};
use crate::stream::MediaKind;

#[derive(Debug, Clone, PartialEq)]
struct TestPacket {
    index: usize,
    seq: u32,
}

impl StreamPacket for TestPacket {
    fn stream_index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TestFrame(u32);

struct ScriptedReader {
    packets: VecDeque<TestPacket>,
    interrupt: Interrupt,
}

impl PacketReader for ScriptedReader {
    type Packet = TestPacket;

    fn read_packet(&mut self) -> Result<TestPacket, BusError> {
        if let Some(packet) = self.packets.pop_front() {
            return Ok(packet);
        }
        // Idle transport: block like a socket read until interrupted.
        while !self.interrupt.is_raised() {
            thread::sleep(Duration::from_millis(2));
        }
        Err(BusError::run_error("interrupted"))
    }
}

/// Holds back `latency` frames until end of stream, like a reordering decoder.
struct ScriptedDecoder {
    pending: VecDeque<u32>,
    capacity: usize,
    latency: usize,
    eof: bool,
}

impl FrameDecoder for ScriptedDecoder {
    type Packet = TestPacket;
    type Frame = TestFrame;

    fn send_packet(&mut self, packet: &TestPacket) -> Result<(), DecodeError> {
        if self.eof {
            return Err(DecodeError::Eof);
        }
        if self.pending.len() >= self.capacity {
            return Err(DecodeError::Again);
        }
        self.pending.push_back(packet.seq);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.eof = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<TestFrame, DecodeError> {
        if self.eof {
            return self.pending.pop_front().map(TestFrame).ok_or(DecodeError::Eof);
        }
        if self.pending.len() > self.latency {
            return Ok(TestFrame(self.pending.pop_front().unwrap()));
        }
        Err(DecodeError::Again)
    }
}

#[derive(Clone)]
struct Script {
    packets: Vec<TestPacket>,
    stream_index: usize,
    capacity: usize,
    latency: usize,
}

impl Script {
    fn sequential(count: u32, latency: usize) -> Self {
        Self {
            packets: (0..count).map(|seq| TestPacket { index: 0, seq }).collect(),
            stream_index: 0,
            capacity: 64,
            latency,
        }
    }
}

#[derive(Clone, Default)]
struct ScriptedBackend {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl ScriptedBackend {
    fn with(self, descriptor: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(descriptor.to_string(), script);
        self
    }
}

impl MediaBackend for ScriptedBackend {
    type Packet = TestPacket;
    type Frame = TestFrame;
    type Reader = ScriptedReader;
    type Decoder = ScriptedDecoder;

    fn open(
        &self,
        descriptor: &str,
        _kind: MediaKind,
        interrupt: Interrupt,
    ) -> Result<Opened<ScriptedReader, ScriptedDecoder>, BusError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(descriptor)
            .cloned()
            .ok_or_else(|| BusError::init_fail(format!("couldn't open {}", descriptor)))?;
        Ok(Opened {
            reader: ScriptedReader {
                packets: script.packets.into(),
                interrupt,
            },
            decoder: ScriptedDecoder {
                pending: VecDeque::new(),
                capacity: script.capacity,
                latency: script.latency,
                eof: false,
            },
            stream_index: script.stream_index,
        })
    }
}

struct Collect<T>(Mutex<Vec<T>>);

impl<T> Default for Collect<T> {
    fn default() -> Self {
        Self(Mutex::new(Vec::new()))
    }
}

impl<T> Collect<T> {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Sink<TestFrame> for Collect<TestFrame> {
    fn handle(&self, item: TestFrame) {
        self.0.lock().unwrap().push(item);
    }
}

impl Observer<TestPacket> for Collect<TestPacket> {
    fn observe(&self, item: &TestPacket) {
        self.0.lock().unwrap().push(item.clone());
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn frames_of(collect: &Collect<TestFrame>) -> Vec<u32> {
    collect.0.lock().unwrap().iter().map(|f| f.0).collect()
}

#[test]
fn start_without_init_is_refused() {
    let pipeline = Pipeline::new("video", MediaKind::Video, ScriptedBackend::default());
    assert!(matches!(pipeline.start(), Err(BusError::NotInitialized)));
    assert_eq!(pipeline.state(), PipelineState::Uninitialized);
}

#[test]
fn init_failure_leaves_pipeline_uninitialized() {
    let pipeline = Pipeline::new("audio", MediaKind::Audio, ScriptedBackend::default());
    assert!(matches!(
        pipeline.init("./missing"),
        Err(BusError::InitFail(_))
    ));
    assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    assert!(matches!(pipeline.start(), Err(BusError::NotInitialized)));
}

#[test]
fn frames_forwarded_in_order_and_flushed_on_stop() {
    let backend = ScriptedBackend::default().with("a", Script::sequential(6, 2));
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    pipeline.frames().attach(frames.clone());

    pipeline.init("a").unwrap();
    assert_eq!(pipeline.state(), PipelineState::Initialized);
    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(wait_until(|| frames.len() == 4));
    assert!(pipeline.is_receiving());
    assert!(pipeline.is_draining());

    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(!pipeline.is_receiving());
    assert!(!pipeline.is_draining());
}

#[test]
fn stop_is_idempotent() {
    let backend = ScriptedBackend::default().with("a", Script::sequential(3, 1));
    let pipeline = Pipeline::new("audio", MediaKind::Audio, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    pipeline.frames().attach(frames.clone());

    pipeline.stop();
    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| frames.len() == 2));
    pipeline.stop();
    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1, 2]);
    assert!(matches!(pipeline.start(), Err(BusError::NotInitialized)));
}

#[test]
fn flush_with_live_stage_is_noop() {
    let backend = ScriptedBackend::default().with("a", Script::sequential(3, 8));
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    let packets = Arc::new(Collect::<TestPacket>::default());
    pipeline.frames().attach(frames.clone());
    pipeline.packets().attach(packets.clone());

    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| packets.len() == 3));
    pipeline.flush();
    assert_eq!(frames.len(), 0);
    assert!(pipeline.is_receiving());

    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1, 2]);
}

#[test]
fn busy_decoder_drops_packet_and_keeps_receiving() {
    let mut script = Script::sequential(5, 10);
    script.capacity = 2;
    let backend = ScriptedBackend::default().with("a", script);
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    let packets = Arc::new(Collect::<TestPacket>::default());
    pipeline.frames().attach(frames.clone());
    pipeline.packets().attach(packets.clone());

    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| packets.len() == 5));
    thread::sleep(Duration::from_millis(20));
    assert!(pipeline.is_receiving());

    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1]);
}

#[test]
fn wrong_stream_index_ends_receive_stage() {
    let mut script = Script::sequential(2, 0);
    script.packets.push(TestPacket { index: 3, seq: 9 });
    let backend = ScriptedBackend::default().with("a", script);
    let pipeline = Pipeline::new("audio", MediaKind::Audio, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    pipeline.frames().attach(frames.clone());

    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| !pipeline.is_receiving()));
    assert!(wait_until(|| frames.len() == 2));
    assert!(pipeline.is_draining());
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1]);
}

#[test]
fn packets_observed_in_read_order() {
    let backend = ScriptedBackend::default().with("a", Script::sequential(4, 0));
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    let packets = Arc::new(Collect::<TestPacket>::default());
    pipeline.packets().attach(packets.clone());

    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| packets.len() == 4));
    pipeline.stop();

    let seen: Vec<u32> = packets.0.lock().unwrap().iter().map(|p| p.seq).collect();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn reinit_replaces_context() {
    let backend = ScriptedBackend::default()
        .with("a", Script::sequential(2, 0))
        .with("b", Script::sequential(3, 0));
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    let frames = Arc::new(Collect::<TestFrame>::default());
    pipeline.frames().attach(frames.clone());

    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(|| frames.len() == 2));
    pipeline.stop();

    pipeline.init("b").unwrap();
    assert_eq!(pipeline.descriptor().as_deref(), Some("b"));
    pipeline.start().unwrap();
    assert!(wait_until(|| frames.len() == 5));
    pipeline.stop();
    assert_eq!(frames_of(&frames), vec![0, 1, 0, 1, 2]);
}

#[test]
fn init_refused_while_running() {
    let backend = ScriptedBackend::default()
        .with("a", Script::sequential(1, 0))
        .with("b", Script::sequential(1, 0));
    let pipeline = Pipeline::new("video", MediaKind::Video, backend);
    pipeline.init("a").unwrap();
    pipeline.start().unwrap();
    assert!(matches!(pipeline.init("b"), Err(BusError::InitFail(_))));
    assert_eq!(pipeline.descriptor().as_deref(), Some("a"));
    pipeline.stop();
}
