use ffmpeg_next::Rational;
use ffmpeg_next::format::Sample;
use ffmpeg_next::format::sample::Type as SampleLayout;

use crate::stream::MediaKind;

/// What presentation needs to know about a decoded frame to schedule it.
pub trait MediaFrame: Send + 'static {
    fn kind(&self) -> MediaKind;
    fn pts_ms(&self) -> Option<i64>;
    fn duration_ms(&self) -> Option<i64>;
}

/// Decoded media unit. Dropping it releases the underlying FFmpeg frame.
#[derive(Clone)]
pub enum RawFrame {
    Video(RawVideoFrame),
    Audio(RawAudioFrame),
}

impl RawFrame {
    pub fn time_base(&self) -> Rational {
        match self {
            RawFrame::Video(frame) => frame.time_base,
            RawFrame::Audio(frame) => frame.time_base,
        }
    }

    pub fn pts(&self) -> Option<i64> {
        match self {
            RawFrame::Video(frame) => frame.frame.pts(),
            RawFrame::Audio(frame) => frame.frame.pts(),
        }
    }

    pub fn duration(&self) -> Option<i64> {
        let duration = unsafe {
            match self {
                RawFrame::Video(frame) => (*frame.frame.as_ptr()).duration,
                RawFrame::Audio(frame) => (*frame.frame.as_ptr()).duration,
            }
        };
        (duration > 0).then_some(duration)
    }
}

impl MediaFrame for RawFrame {
    fn kind(&self) -> MediaKind {
        match self {
            RawFrame::Video(_) => MediaKind::Video,
            RawFrame::Audio(_) => MediaKind::Audio,
        }
    }

    fn pts_ms(&self) -> Option<i64> {
        self.pts().and_then(|pts| to_millis(pts, self.time_base()))
    }

    fn duration_ms(&self) -> Option<i64> {
        self.duration()
            .and_then(|duration| to_millis(duration, self.time_base()))
    }
}

/// Converts a timestamp in `time_base` units to milliseconds.
pub fn to_millis(value: i64, time_base: Rational) -> Option<i64> {
    let num = time_base.numerator() as i128;
    let den = time_base.denominator() as i128;
    if den == 0 {
        return None;
    }
    i64::try_from(value as i128 * num * 1000 / den).ok()
}

#[derive(Clone)]
pub struct RawVideoFrame {
    frame: ffmpeg_next::frame::Video,
    time_base: Rational,
}

impl RawVideoFrame {
    pub fn new(frame: ffmpeg_next::frame::Video, time_base: Rational) -> Self {
        Self { frame, time_base }
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn format(&self) -> ffmpeg_next::format::Pixel {
        self.frame.format()
    }

    pub fn as_video(&self) -> &ffmpeg_next::frame::Video {
        &self.frame
    }
}

#[derive(Clone)]
pub struct RawAudioFrame {
    frame: ffmpeg_next::frame::Audio,
    time_base: Rational,
}

impl RawAudioFrame {
    pub fn new(frame: ffmpeg_next::frame::Audio, time_base: Rational) -> Self {
        Self { frame, time_base }
    }

    pub fn format(&self) -> Sample {
        self.frame.format()
    }

    pub fn rate(&self) -> u32 {
        self.frame.rate()
    }

    pub fn channels(&self) -> u16 {
        unsafe { (*self.frame.as_ptr()).ch_layout.nb_channels.max(0) as u16 }
    }

    pub fn samples(&self) -> usize {
        self.frame.samples()
    }

    pub fn as_audio(&self) -> &ffmpeg_next::frame::Audio {
        &self.frame
    }

    /// Copies the samples out as interleaved f32.
    ///
    /// Planar layouts are interleaved channel by channel; packed layouts are
    /// copied as they are. Signed 16 and 32 bit integer samples are scaled
    /// to [-1, 1]. Other sample formats yield nothing.
    pub fn interleaved_f32(&self) -> Vec<f32> {
        let channels = self.channels() as usize;
        let samples = self.samples();
        if channels == 0 || samples == 0 {
            return Vec::new();
        }
        let decode: fn(&[u8]) -> f32 = match self.format() {
            Sample::F32(_) => |b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            Sample::I16(_) => |b| i16::from_ne_bytes([b[0], b[1]]) as f32 / 32768.0,
            Sample::I32(_) => {
                |b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2147483648.0
            }
            other => {
                log::debug!("unsupported sample format {:?}", other);
                return Vec::new();
            }
        };
        let width = self.format().bytes();

        match self.format() {
            Sample::F32(SampleLayout::Planar)
            | Sample::I16(SampleLayout::Planar)
            | Sample::I32(SampleLayout::Planar) => {
                let mut out = vec![0.0; samples * channels];
                for ch in 0..channels.min(self.frame.planes()) {
                    let plane = self.frame.data(ch);
                    for (i, bytes) in plane.chunks_exact(width).take(samples).enumerate() {
                        out[i * channels + ch] = decode(bytes);
                    }
                }
                out
            }
            _ => self
                .frame
                .data(0)
                .chunks_exact(width)
                .take(samples * channels)
                .map(decode)
                .collect(),
        }
    }
}
