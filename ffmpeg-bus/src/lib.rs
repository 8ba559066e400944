/// Registers FFmpeg components and networking. Call once at startup before
/// opening any transport.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::format::network::init();
    Ok(())
}

/// Keeps FFmpeg's own logging at errors only, so it doesn't scribble over a
/// full-screen terminal UI.
pub fn quiet_ffmpeg_logging() {
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);
}

pub mod decoder;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod input;
pub mod packet;
pub mod pipeline;
pub mod scaler;
pub mod stream;
pub mod worker;

pub use error::{BusError, DecodeError};
pub use fanout::{Observer, Observers, Sink, Source};
pub use frame::{MediaFrame, RawFrame};
pub use pipeline::{FfmpegBackend, MediaBackend, Pipeline, PipelineState};
pub use stream::MediaKind;
pub use worker::Worker;
