use std::fmt;

use ffmpeg_next::{Rational, codec::Parameters, format::stream};

/// Which of the two media lanes a stream, pipeline or frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Maps the control-protocol group number (0 audio, 1 video).
    pub fn from_group(group: i64) -> Option<Self> {
        match group {
            0 => Some(MediaKind::Audio),
            1 => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn group(self) -> i64 {
        match self {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn medium(self) -> ffmpeg_next::media::Type {
        match self {
            MediaKind::Audio => ffmpeg_next::media::Type::Audio,
            MediaKind::Video => ffmpeg_next::media::Type::Video,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

pub struct AvStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn kind(&self) -> Option<MediaKind> {
        match self.parameters.medium() {
            ffmpeg_next::media::Type::Video => Some(MediaKind::Video),
            ffmpeg_next::media::Type::Audio => Some(MediaKind::Audio),
            _ => None,
        }
    }

    pub fn codec(&self) -> ffmpeg_next::codec::Id {
        self.parameters.id()
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
        }
    }
}

impl Clone for AvStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
        }
    }
}
