use std::ffi::{CString, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ffmpeg_next::Dictionary;

use crate::{
    error::BusError,
    packet::RawPacket,
    pipeline::PacketReader,
    stream::{AvStream, MediaKind},
};

/// Flag polled by blocking transport reads; raising it makes them return.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn as_opaque(&self) -> *mut c_void {
        Arc::as_ptr(&self.0) as *mut c_void
    }
}

unsafe extern "C" fn interrupt_requested(opaque: *mut c_void) -> c_int {
    let flag = unsafe { &*(opaque as *const AtomicBool) };
    flag.load(Ordering::SeqCst) as c_int
}

/// Demuxer options for RTP sessions described by an SDP file or URI.
pub fn transport_options(kind: MediaKind) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    options.set("protocol_whitelist", "file,udp,rtp,rtcp,rtp_mpegts");
    if kind == MediaKind::Video {
        options.set("fifo_size", "16M");
        options.set("buffer_size", "384K");
    }
    options
}

/// An opened transport with the best stream of one kind selected.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    stream: AvStream,
    // Kept alive for the interrupt callback registered on `inner`.
    interrupt: Interrupt,
}

unsafe impl Send for AvInput {}

impl AvInput {
    pub fn open(url: &str, kind: MediaKind, interrupt: Interrupt) -> Result<Self, BusError> {
        let path = CString::new(url)
            .map_err(|e| BusError::init_fail(format!("invalid descriptor {:?}: {}", url, e)))?;

        let inner = unsafe {
            let mut ctx = ffmpeg_next::ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(BusError::init_fail("couldn't allocate format context"));
            }
            (*ctx).interrupt_callback = ffmpeg_next::ffi::AVIOInterruptCB {
                callback: Some(interrupt_requested),
                opaque: interrupt.as_opaque(),
            };

            let mut options = transport_options(kind).disown();
            let ret = ffmpeg_next::ffi::avformat_open_input(
                &mut ctx,
                path.as_ptr(),
                ptr::null_mut(),
                &mut options,
            );
            drop(Dictionary::own(options));
            if ret < 0 {
                return Err(BusError::init_fail(format!(
                    "couldn't open input stream {}: {}",
                    url,
                    ffmpeg_next::Error::from(ret)
                )));
            }

            let input = ffmpeg_next::format::context::Input::wrap(ctx);
            let ret = ffmpeg_next::ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                return Err(BusError::init_fail(format!(
                    "couldn't find stream information: {}",
                    ffmpeg_next::Error::from(ret)
                )));
            }
            input
        };

        ffmpeg_next::format::context::input::dump(&inner, 0, Some(url));

        let stream = inner
            .streams()
            .best(kind.medium())
            .map(AvStream::from)
            .ok_or_else(|| BusError::init_fail(format!("no {} stream in {}", kind, url)))?;

        log::info!(
            "Input: {} stream #{} codec {:?} time_base {:?}",
            kind,
            stream.index(),
            stream.codec(),
            stream.time_base()
        );

        Ok(Self {
            inner,
            stream,
            interrupt,
        })
    }

    pub fn stream(&self) -> &AvStream {
        &self.stream
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}

impl PacketReader for AvInput {
    type Packet = RawPacket;

    fn read_packet(&mut self) -> Result<RawPacket, BusError> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        packet
            .read(&mut self.inner)
            .map_err(|e| BusError::run_error(format!("can't read packet: {}", e)))?;
        let time_base = self
            .inner
            .stream(packet.stream())
            .map(|s| s.time_base())
            .unwrap_or_else(|| self.stream.time_base());
        Ok((packet, time_base).into())
    }
}
