use ffmpeg_next::Rational;

use crate::{
    error::{BusError, DecodeError},
    frame::{RawAudioFrame, RawFrame, RawVideoFrame},
    packet::RawPacket,
    pipeline::FrameDecoder,
    stream::{AvStream, MediaKind},
};

/// Slice threads used by video decoders.
pub const VIDEO_DECODE_THREADS: i32 = 4;

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &ffmpeg_next::codec::packet::Packet) -> Result<(), DecodeError> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_packet(packet)?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_packet(packet)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_eof()?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_frame(&mut self, time_base: Rational) -> Result<RawFrame, DecodeError> {
        match self {
            DecoderType::Video(video_decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                video_decoder.receive_frame(&mut frame)?;
                Ok(RawFrame::Video(RawVideoFrame::new(frame, time_base)))
            }
            DecoderType::Audio(audio_decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                audio_decoder.receive_frame(&mut frame)?;
                Ok(RawFrame::Audio(RawAudioFrame::new(frame, time_base)))
            }
        }
    }
}

pub struct Decoder {
    stream: AvStream,
    inner: DecoderType,
}

unsafe impl Send for Decoder {}

impl Decoder {
    pub fn new(stream: &AvStream) -> Result<Self, BusError> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;

        let inner = match stream.kind() {
            Some(MediaKind::Video) => {
                unsafe {
                    let ctx = decoder_ctx.as_mut_ptr();
                    (*ctx).thread_count = VIDEO_DECODE_THREADS;
                    (*ctx).thread_type = ffmpeg_next::ffi::FF_THREAD_SLICE as i32;
                }
                DecoderType::Video(decoder_ctx.decoder().video()?)
            }
            Some(MediaKind::Audio) => DecoderType::Audio(decoder_ctx.decoder().audio()?),
            None => return Err(BusError::init_fail("unsupported stream type")),
        };

        log::info!(
            "Decoder: opened {:?} for stream #{}",
            stream.codec(),
            stream.index()
        );

        Ok(Self {
            stream: stream.clone(),
            inner,
        })
    }

    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }
}

impl FrameDecoder for Decoder {
    type Packet = RawPacket;
    type Frame = RawFrame;

    fn send_packet(&mut self, packet: &RawPacket) -> Result<(), DecodeError> {
        self.inner.send_packet(packet.packet())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.inner.send_eof()
    }

    fn receive_frame(&mut self) -> Result<RawFrame, DecodeError> {
        self.inner.receive_frame(self.stream.time_base())
    }
}
