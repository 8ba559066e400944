use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, Flags};

use crate::{error::BusError, frame::RawVideoFrame};

/// Tightly packed RGB24 pixels.
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Converts decoded video frames to RGB24 at a requested size.
///
/// The conversion context is rebuilt whenever the source geometry, source
/// format or target size changes.
pub struct Scaler {
    context: Option<Context>,
    key: (Pixel, u32, u32, u32, u32),
}

unsafe impl Send for Scaler {}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            key: (Pixel::None, 0, 0, 0, 0),
        }
    }

    /// Drops the cached conversion context.
    pub fn reset(&mut self) {
        self.context = None;
    }

    pub fn to_rgb(
        &mut self,
        frame: &RawVideoFrame,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, BusError> {
        let (width, height) = (width.max(1), height.max(1));
        let key = (frame.format(), frame.width(), frame.height(), width, height);
        if self.context.is_none() || self.key != key {
            let context = Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::RGB24,
                width,
                height,
                Flags::BILINEAR,
            )?;
            log::debug!(
                "Scaler: {:?} {}x{} -> rgb24 {}x{}",
                frame.format(),
                frame.width(),
                frame.height(),
                width,
                height
            );
            self.context = Some(context);
            self.key = key;
        }
        let Some(context) = self.context.as_mut() else {
            return Err(BusError::run_error("scaler context missing"));
        };

        let mut rgb = ffmpeg_next::frame::Video::empty();
        context.run(frame.as_video(), &mut rgb)?;

        let row = width as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb
            .data(0)
            .chunks(stride)
            .take(height as usize)
            .flat_map(|line| &line[..row])
            .copied()
            .collect();
        Ok(RgbImage {
            width,
            height,
            data,
        })
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}
