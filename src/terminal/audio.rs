use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use ffmpeg_bus::{RawFrame, Worker};
use tokio_util::sync::CancellationToken;

use crate::present::AudioOutput;

const CONTROL_POLL: Duration = Duration::from_millis(100);

/// Single producer, single consumer sample buffer shared with the device
/// callback.
///
/// Only the consumer moves `read_pos`; the producer asks for trims through
/// `trim_request`, which the consumer honors before its next read.
struct RingBuffer {
    buf: Vec<AtomicU32>,
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    trim_request: AtomicUsize,
}

const NO_TRIM: usize = usize::MAX;

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            buf: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            trim_request: AtomicUsize::new(NO_TRIM),
        }
    }

    fn available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        if w >= r { w - r } else { self.capacity - r + w }
    }

    fn free_space(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    fn write(&self, samples: &[f32]) -> usize {
        let count = samples.len().min(self.free_space());
        let mut pos = self.write_pos.load(Ordering::Relaxed);
        for sample in &samples[..count] {
            self.buf[pos].store(sample.to_bits(), Ordering::Relaxed);
            pos = (pos + 1) % self.capacity;
        }
        self.write_pos.store(pos, Ordering::Release);
        count
    }

    fn read(&self, output: &mut [f32]) -> usize {
        self.apply_trim();
        let count = output.len().min(self.available());
        let mut pos = self.read_pos.load(Ordering::Relaxed);
        for slot in &mut output[..count] {
            *slot = f32::from_bits(self.buf[pos].load(Ordering::Relaxed));
            pos = (pos + 1) % self.capacity;
        }
        self.read_pos.store(pos, Ordering::Release);
        count
    }

    /// Asks the consumer to drop the oldest samples beyond `max_samples`
    /// before it next reads. The smallest pending request wins.
    fn trim_to(&self, max_samples: usize) {
        self.trim_request.fetch_min(max_samples, Ordering::AcqRel);
    }

    fn apply_trim(&self) {
        let max_samples = self.trim_request.swap(NO_TRIM, Ordering::AcqRel);
        if max_samples == NO_TRIM {
            return;
        }
        let available = self.available();
        if available > max_samples {
            let r = self.read_pos.load(Ordering::Relaxed);
            self.read_pos
                .store((r + available - max_samples) % self.capacity, Ordering::Release);
        }
    }

    fn clear(&self) {
        self.trim_to(0);
    }
}

/// Maps interleaved samples from one channel count to another. Mono is
/// spread to every output channel, folding to mono averages, anything else
/// repeats source channels in order.
fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples.to_vec();
    }
    samples
        .chunks_exact(from)
        .flat_map(|frame| {
            (0..to).map(move |ch| {
                if to == 1 {
                    frame.iter().sum::<f32>() / from as f32
                } else {
                    frame[ch % from]
                }
            })
        })
        .collect()
}

fn linear_resample(input: &[f32], from_rate: u32, to_rate: u32, output_len: usize) -> Vec<f32> {
    if input.is_empty() {
        return vec![0.0; output_len];
    }
    let ratio = from_rate as f64 / to_rate as f64;
    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input.get(idx).copied().unwrap_or(0.0);
            let b = input.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// Resamples each channel of an interleaved buffer separately.
fn resample_interleaved(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / channels;
    let out_frames = (frames as u64 * to_rate as u64 / from_rate as u64) as usize;

    let mut out = vec![0.0; out_frames * channels];
    for ch in 0..channels {
        let lane: Vec<f32> = samples.iter().skip(ch).step_by(channels).copied().collect();
        for (i, sample) in linear_resample(&lane, from_rate, to_rate, out_frames)
            .into_iter()
            .enumerate()
        {
            out[i * channels + ch] = sample;
        }
    }
    out
}

enum Playback {
    Play,
    Pause,
}

/// Plays audio frames on the default output device.
///
/// The device stream lives on its own `audio-output` thread; frames are
/// converted to the device's rate and channel count and written to a ring
/// buffer the device callback reads from.
pub struct CpalOutput {
    ring: Arc<RingBuffer>,
    rate: u32,
    channels: u16,
    max_latency: usize,
    control: Sender<Playback>,
    worker: Option<Worker>,
}

impl CpalOutput {
    pub fn open() -> anyhow::Result<Self> {
        let (control, commands) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let worker = Worker::spawn("audio-output", move |cancel| {
            let stream = match open_stream() {
                Ok((stream, ring, rate, channels)) => {
                    let _ = ready_tx.send(Ok((ring, rate, channels)));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            control_loop(cancel, &stream, &commands);
        })?;

        let (ring, rate, channels) = ready_rx
            .recv()
            .map_err(|_| anyhow!("audio output thread exited"))??;
        log::info!("Audio: output {} Hz, {} channels", rate, channels);
        Ok(Self {
            ring,
            rate,
            channels,
            // Half a second.
            max_latency: rate as usize * channels as usize / 2,
            control,
            worker: Some(worker),
        })
    }
}

type Opened = (cpal::Stream, Arc<RingBuffer>, u32, u16);

fn open_stream() -> anyhow::Result<Opened> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no audio output device"))?;
    let supported = device.default_output_config()?;
    let rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ring = Arc::new(RingBuffer::new(rate as usize * channels as usize));
    let reader = ring.clone();
    let mut last_sample = 0.0f32;
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let read = reader.read(data);
            if read > 0 {
                last_sample = data[read - 1];
            }
            // Fade out on underrun.
            for sample in &mut data[read..] {
                last_sample *= 0.95;
                *sample = last_sample;
            }
        },
        |e| log::error!("Audio: stream error: {}", e),
        None,
    )?;
    stream.play()?;
    Ok((stream, ring, rate, channels))
}

fn control_loop(
    cancel: CancellationToken,
    stream: &cpal::Stream,
    commands: &crossbeam_channel::Receiver<Playback>,
) {
    while !cancel.is_cancelled() {
        let result = match commands.recv_timeout(CONTROL_POLL) {
            Ok(Playback::Play) => stream.play().map_err(|e| e.to_string()),
            Ok(Playback::Pause) => stream.pause().map_err(|e| e.to_string()),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = result {
            log::warn!("Audio: playback control failed: {}", e);
        }
    }
}

impl AudioOutput<RawFrame> for CpalOutput {
    fn prepare(&mut self) -> anyhow::Result<()> {
        self.ring.clear();
        Ok(())
    }

    fn queued_bytes(&self) -> usize {
        self.ring.available() * std::mem::size_of::<f32>()
    }

    fn clear(&mut self) {
        self.ring.clear();
    }

    fn push(&mut self, frame: &RawFrame) -> anyhow::Result<()> {
        let RawFrame::Audio(audio) = frame else {
            return Err(anyhow!("not an audio frame"));
        };
        let mixed = remix(&audio.interleaved_f32(), audio.channels(), self.channels);
        let samples = resample_interleaved(&mixed, self.channels, audio.rate(), self.rate);

        self.ring.trim_to(self.max_latency);
        let written = self.ring.write(&samples);
        if written < samples.len() {
            log::debug!("Audio: {} samples didn't fit", samples.len() - written);
        }
        Ok(())
    }

    fn pause(&mut self) {
        let _ = self.control.send(Playback::Pause);
    }

    fn resume(&mut self) {
        let _ = self.control.send(Playback::Play);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}
