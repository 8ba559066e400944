use ffmpeg_next::Rational;

use crate::pipeline::StreamPacket;

/// Encoded media unit read from a transport, tagged with its stream time base.
///
/// Not `Clone`: a packet has one owner at a time and observers only borrow it.
pub struct RawPacket {
    packet: ffmpeg_next::codec::packet::Packet,
    time_base: Rational,
}

impl RawPacket {
    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn packet(&self) -> &ffmpeg_next::codec::packet::Packet {
        &self.packet
    }
}

impl StreamPacket for RawPacket {
    fn stream_index(&self) -> usize {
        self.packet.stream()
    }
}

impl From<(ffmpeg_next::codec::packet::Packet, Rational)> for RawPacket {
    fn from((packet, time_base): (ffmpeg_next::codec::packet::Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}
