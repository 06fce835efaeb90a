//! The unit of media exchange between the demuxers, codec parsers, stream
//! fan-out, and remuxers.

use bytes::Bytes;
use lml_amf0::Amf0Value;

/// What a packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Script,
}

/// Wire-specific side data attached to a packet by whichever component
/// parsed or produced it.  Consumers match on the variant they expect.
#[derive(Debug, Clone, Default)]
pub enum Side {
    #[default]
    Empty,

    Audio {
        sample_rate: u8,
        sample_size: u8,
        sample_type: u8,
        data_type: u8,
        dts: u32,
        pts: u32,
        data: Bytes,
    },

    Video {
        frame_type: u8,
        data_type: u8,
        cts: u32,
        dts: u32,
        pts: u32,
        keyframe: bool,
        nalu_type: u8,
        nalus: Vec<Bytes>,
        data: Bytes,
    },

    Script {
        handler: String,
        key: String,
        value: Amf0Value,
    },

    Rtp {
        v: u8,
        p: u8,
        x: u8,
        cc: u8,
        m: u8,
        pt: u8,
        sn: u16,
        timestamp: u32,
        ssrc: u32,
        csrc: Vec<u32>,
    },
}

/// A media packet.  `position` is a parse cursor into `payload`; the
/// invariant `position <= payload.len()` holds at all times.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub codec: &'static str,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
    pub position: usize,
    pub side: Side,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Bytes) -> Packet {
        Packet {
            kind,
            codec: "",
            timestamp: 0,
            stream_id: 0,
            payload,
            position: 0,
            side: Side::Empty,
        }
    }

    /// Bytes remaining after the parse cursor
    pub fn left(&self) -> usize {
        self.payload.len().saturating_sub(self.position)
    }

    /// Advances the cursor, clamped at the end of the payload
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.payload.len());
    }

    /// The payload from the parse cursor onward
    pub fn remaining(&self) -> Bytes {
        self.payload.slice(self.position..)
    }

    /// Clones the packet with a different payload, keeping kind, codec,
    /// timing and stream identity
    pub fn with_payload(&self, payload: Bytes) -> Packet {
        Packet {
            kind: self.kind,
            codec: self.codec,
            timestamp: self.timestamp,
            stream_id: self.stream_id,
            payload,
            position: 0,
            side: self.side.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_and_advance_respect_the_payload_bounds() {
        let mut packet = Packet::new(PacketKind::Audio, Bytes::from(vec![1, 2, 3, 4]));

        assert_eq!(packet.left(), 4);
        packet.advance(1);
        assert_eq!(packet.left(), 3);
        assert_eq!(&packet.remaining()[..], &[2, 3, 4]);

        packet.advance(100);
        assert_eq!(packet.position, 4);
        assert_eq!(packet.left(), 0);
    }

    #[test]
    fn with_payload_keeps_identity_and_resets_cursor() {
        let mut packet = Packet::new(PacketKind::Video, Bytes::from(vec![1, 2, 3]));
        packet.timestamp = 99;
        packet.stream_id = 7;
        packet.codec = "AVC";
        packet.advance(2);

        let cloned = packet.with_payload(Bytes::from(vec![5, 6]));
        assert_eq!(cloned.timestamp, 99);
        assert_eq!(cloned.stream_id, 7);
        assert_eq!(cloned.codec, "AVC");
        assert_eq!(cloned.position, 0);
        assert_eq!(&cloned.payload[..], &[5, 6]);
    }
}
