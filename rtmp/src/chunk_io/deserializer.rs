use super::chunk_header::{ChunkHeader, ChunkHeaderFormat};
use super::{ChunkDeserializationError, INITIAL_MAX_CHUNK_SIZE, MAX_NEGOTIABLE_CHUNK_SIZE};
use crate::messages::MessagePayload;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use std::cmp::min;
use std::collections::HashMap;
use std::mem;

const MAX_INITIAL_TIMESTAMP: u32 = 0xFFFFFF;

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum ParseStage {
    BasicHeader,
    MessageHeader,
    ExtendedTimestamp,
    Payload,
}

#[derive(Eq, PartialEq, Debug)]
enum StepResult {
    NeedMoreBytes,
    Advanced,
}

/// Reassembles RTMP chunks into complete message payloads.
///
/// Chunks compress their headers against the previous chunk seen on the same
/// chunk stream id, so every byte a peer sends after the handshake must pass
/// through the same deserializer instance, in order.
///
/// `get_next_message` returns at most one message per call.  When a call
/// returned a message the remaining buffered input may contain more, so
/// callers should keep invoking it with an empty slice until `None` comes
/// back.  This matters because a `SetChunkSize` message must be applied via
/// `set_max_chunk_size` before the following message is parsed.
pub struct ChunkDeserializer {
    max_chunk_size: usize,
    buffer: BytesMut,
    stage: ParseStage,
    current_format: ChunkHeaderFormat,
    current_header: ChunkHeader,
    current_payload: MessagePayload,
    payload_so_far: BytesMut,
    previous_headers: HashMap<u32, ChunkHeader>,
}

impl ChunkDeserializer {
    pub fn new() -> ChunkDeserializer {
        ChunkDeserializer {
            max_chunk_size: INITIAL_MAX_CHUNK_SIZE as usize,
            buffer: BytesMut::with_capacity(4096),
            stage: ParseStage::BasicHeader,
            current_format: ChunkHeaderFormat::Full,
            current_header: ChunkHeader::new(),
            current_payload: MessagePayload::new(),
            payload_so_far: BytesMut::new(),
            previous_headers: HashMap::new(),
        }
    }

    /// Attempts to read one complete RTMP message from the passed in bytes
    /// (plus anything previously buffered).
    pub fn get_next_message(
        &mut self,
        bytes: &[u8],
    ) -> Result<Option<MessagePayload>, ChunkDeserializationError> {
        self.buffer.extend_from_slice(bytes);

        loop {
            let mut completed_message = None;
            let result = match self.stage {
                ParseStage::BasicHeader => self.parse_basic_header()?,
                ParseStage::MessageHeader => self.parse_message_header()?,
                ParseStage::ExtendedTimestamp => self.parse_extended_timestamp()?,
                ParseStage::Payload => self.parse_payload(&mut completed_message)?,
            };

            if result == StepResult::NeedMoreBytes || completed_message.is_some() {
                return Ok(completed_message);
            }
        }
    }

    /// Applies a new inbound maximum chunk size.  Should be called in direct
    /// reaction to a `SetChunkSize` message from the peer.
    pub fn set_max_chunk_size(&mut self, new_size: usize) -> Result<(), ChunkDeserializationError> {
        if new_size == 0 || new_size > MAX_NEGOTIABLE_CHUNK_SIZE as usize {
            return Err(ChunkDeserializationError::InvalidMaxChunkSize {
                chunk_size: new_size,
            });
        }

        self.max_chunk_size = new_size;
        Ok(())
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn parse_basic_header(&mut self) -> Result<StepResult, ChunkDeserializationError> {
        if self.buffer.is_empty() {
            return Ok(StepResult::NeedMoreBytes);
        }

        let format = match self.buffer[0] >> 6 {
            0 => ChunkHeaderFormat::Full,
            1 => ChunkHeaderFormat::TimeDeltaWithoutMessageStreamId,
            2 => ChunkHeaderFormat::TimeDeltaOnly,
            _ => ChunkHeaderFormat::Empty,
        };

        let (csid, header_size) = match self.buffer[0] & 0x3F {
            0 => {
                if self.buffer.len() < 2 {
                    return Ok(StepResult::NeedMoreBytes);
                }

                (self.buffer[1] as u32 + 64, 2)
            }

            1 => {
                if self.buffer.len() < 3 {
                    return Ok(StepResult::NeedMoreBytes);
                }

                (self.buffer[2] as u32 * 256 + self.buffer[1] as u32 + 64, 3)
            }

            x => (x as u32, 1),
        };

        self.current_header = match format {
            ChunkHeaderFormat::Full => {
                let mut header = ChunkHeader::new();
                header.chunk_stream_id = csid;
                header
            }

            _ => match self.previous_headers.remove(&csid) {
                None => return Err(ChunkDeserializationError::NoPreviousChunkOnStream { csid }),
                Some(header) => header,
            },
        };

        self.current_format = format;
        self.buffer.advance(header_size);
        self.stage = ParseStage::MessageHeader;
        Ok(StepResult::Advanced)
    }

    fn parse_message_header(&mut self) -> Result<StepResult, ChunkDeserializationError> {
        let needed = match self.current_format {
            ChunkHeaderFormat::Full => 11,
            ChunkHeaderFormat::TimeDeltaWithoutMessageStreamId => 7,
            ChunkHeaderFormat::TimeDeltaOnly => 3,
            ChunkHeaderFormat::Empty => 0,
        };

        if self.buffer.len() < needed {
            return Ok(StepResult::NeedMoreBytes);
        }

        match self.current_format {
            ChunkHeaderFormat::Empty => {
                // Encoders split messages larger than the chunk size into a
                // leading chunk plus format 3 continuations.  The previous
                // delta is applied only to the first chunk of a message,
                // otherwise continuation chunks would inflate the clock.
                if self.payload_so_far.is_empty() {
                    self.current_header.timestamp =
                        self.current_header.timestamp + self.current_header.timestamp_field;
                }
            }

            ref format => {
                let timestamp_field = BigEndian::read_u24(&self.buffer[0..3]);
                if *format == ChunkHeaderFormat::Full {
                    self.current_header.timestamp.set(timestamp_field);
                } else {
                    // Non full headers carry deltas only
                    self.current_header.timestamp =
                        self.current_header.timestamp + timestamp_field;
                }

                self.current_header.timestamp_field = timestamp_field;

                if *format != ChunkHeaderFormat::TimeDeltaOnly {
                    self.current_header.message_length = BigEndian::read_u24(&self.buffer[3..6]);
                    self.current_header.message_type_id = self.buffer[6];
                }

                if *format == ChunkHeaderFormat::Full {
                    self.current_header.message_stream_id =
                        LittleEndian::read_u32(&self.buffer[7..11]);
                }

                self.buffer.advance(needed);
            }
        }

        self.stage = ParseStage::ExtendedTimestamp;
        Ok(StepResult::Advanced)
    }

    fn parse_extended_timestamp(&mut self) -> Result<StepResult, ChunkDeserializationError> {
        if self.current_header.timestamp_field < MAX_INITIAL_TIMESTAMP {
            self.stage = ParseStage::Payload;
            return Ok(StepResult::Advanced);
        }

        if self.buffer.len() < 4 {
            return Ok(StepResult::NeedMoreBytes);
        }

        let extended = BigEndian::read_u32(&self.buffer[0..4]);
        self.buffer.advance(4);

        if self.current_format == ChunkHeaderFormat::Full {
            self.current_header.timestamp.set(extended);
        } else if self.payload_so_far.is_empty() {
            // The 24 bit sentinel was already added as a delta, only the
            // difference is still outstanding.  Continuation chunks of the
            // same message repeat the extended field and are ignored.
            self.current_header.timestamp =
                self.current_header.timestamp + (extended - MAX_INITIAL_TIMESTAMP);
        }

        self.stage = ParseStage::Payload;
        Ok(StepResult::Advanced)
    }

    fn parse_payload(
        &mut self,
        completed_message: &mut Option<MessagePayload>,
    ) -> Result<StepResult, ChunkDeserializationError> {
        let message_length = self.current_header.message_length as usize;
        let remaining = message_length - self.payload_so_far.len();
        let this_chunk = min(remaining, self.max_chunk_size);

        if self.buffer.len() < this_chunk {
            return Ok(StepResult::NeedMoreBytes);
        }

        self.current_payload.timestamp = self.current_header.timestamp;
        self.current_payload.type_id = self.current_header.message_type_id;
        self.current_payload.message_stream_id = self.current_header.message_stream_id;

        if remaining > self.payload_so_far.capacity() - self.payload_so_far.len() {
            self.payload_so_far.reserve(remaining);
        }

        let bytes = self.buffer.split_to(this_chunk);
        self.payload_so_far.extend_from_slice(&bytes);

        if self.payload_so_far.len() == message_length {
            let data = mem::replace(&mut self.payload_so_far, BytesMut::new());
            self.current_payload.data = data.freeze();

            let payload = mem::replace(&mut self.current_payload, MessagePayload::new());
            *completed_message = Some(payload);
        }

        // The chunk is done; remember its header for the next one on this csid
        let header = mem::replace(&mut self.current_header, ChunkHeader::new());
        self.previous_headers.insert(header.chunk_stream_id, header);
        self.stage = ParseStage::BasicHeader;
        Ok(StepResult::Advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RtmpTimestamp;
    use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
    use std::io::{Cursor, Write};

    fn write_basic_header(cursor: &mut Cursor<Vec<u8>>, format: u8, csid: u32) {
        if csid < 64 {
            cursor.write_u8((format << 6) | csid as u8).unwrap();
        } else if csid < 320 {
            cursor.write_u8(format << 6).unwrap();
            cursor.write_u8((csid - 64) as u8).unwrap();
        } else {
            cursor.write_u8((format << 6) | 1).unwrap();
            cursor.write_u16::<LittleEndian>((csid - 64) as u16).unwrap();
        }
    }

    fn type_0_chunk(
        csid: u32,
        timestamp: u32,
        message_stream_id: u32,
        type_id: u8,
        payload: &[u8],
        max_chunk_size: usize,
    ) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        write_basic_header(&mut cursor, 0, csid);

        let field = min(timestamp, 0xFFFFFF);
        cursor.write_u24::<BigEndian>(field).unwrap();
        cursor.write_u24::<BigEndian>(payload.len() as u32).unwrap();
        cursor.write_u8(type_id).unwrap();
        cursor.write_u32::<LittleEndian>(message_stream_id).unwrap();

        if timestamp >= 0xFFFFFF {
            cursor.write_u32::<BigEndian>(timestamp).unwrap();
        }

        if payload.len() > max_chunk_size {
            cursor.write_all(&payload[..max_chunk_size]).unwrap();
            let rest = continuation_chunks(csid, &payload[max_chunk_size..], max_chunk_size);
            cursor.write_all(&rest).unwrap();
        } else {
            cursor.write_all(payload).unwrap();
        }

        cursor.into_inner()
    }

    fn type_1_chunk(csid: u32, delta: u32, type_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        write_basic_header(&mut cursor, 1, csid);
        cursor.write_u24::<BigEndian>(min(delta, 0xFFFFFF)).unwrap();
        cursor.write_u24::<BigEndian>(payload.len() as u32).unwrap();
        cursor.write_u8(type_id).unwrap();
        if delta >= 0xFFFFFF {
            cursor.write_u32::<BigEndian>(delta).unwrap();
        }
        cursor.write_all(payload).unwrap();
        cursor.into_inner()
    }

    fn type_2_chunk(csid: u32, delta: u32, payload: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        write_basic_header(&mut cursor, 2, csid);
        cursor.write_u24::<BigEndian>(min(delta, 0xFFFFFF)).unwrap();
        if delta >= 0xFFFFFF {
            cursor.write_u32::<BigEndian>(delta).unwrap();
        }
        cursor.write_all(payload).unwrap();
        cursor.into_inner()
    }

    fn continuation_chunks(csid: u32, payload: &[u8], max_chunk_size: usize) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        for slice in payload.chunks(max_chunk_size) {
            write_basic_header(&mut cursor, 3, csid);
            cursor.write_all(slice).unwrap();
        }

        cursor.into_inner()
    }

    #[test]
    fn can_read_type_0_chunk_with_each_csid_encoding() {
        for csid in [50_u32, 500, 50000] {
            let payload = [1_u8, 2, 3];
            let bytes = type_0_chunk(csid, 25, 5, 3, &payload, 128);

            let mut deserializer = ChunkDeserializer::new();
            let result = deserializer.get_next_message(&bytes).unwrap().unwrap();

            assert_eq!(result.type_id, 3, "incorrect type id for csid {}", csid);
            assert_eq!(result.timestamp, RtmpTimestamp::new(25));
            assert_eq!(result.message_stream_id, 5);
            assert_eq!(&result.data[..], &payload[..]);
        }
    }

    #[test]
    fn can_read_type_0_chunk_with_extended_timestamp() {
        let payload = [1_u8, 2, 3];
        let bytes = type_0_chunk(50, 16777216, 5, 3, &payload, 128);

        let mut deserializer = ChunkDeserializer::new();
        let result = deserializer.get_next_message(&bytes).unwrap().unwrap();

        assert_eq!(result.timestamp, RtmpTimestamp::new(16777216));
        assert_eq!(&result.data[..], &payload[..]);
    }

    #[test]
    fn deltas_accumulate_across_type_1_2_and_3_chunks() {
        let payload = [1_u8, 2, 3];
        let mut deserializer = ChunkDeserializer::new();

        let chunk0 = type_0_chunk(50, 25, 5, 3, &payload, 128);
        let chunk1 = type_1_chunk(50, 10, 4, &payload);
        let chunk2 = type_2_chunk(50, 11, &payload);
        let chunk3 = continuation_chunks(50, &payload, 128);

        let _ = deserializer.get_next_message(&chunk0).unwrap().unwrap();

        let message1 = deserializer.get_next_message(&chunk1).unwrap().unwrap();
        assert_eq!(message1.type_id, 4);
        assert_eq!(message1.timestamp, RtmpTimestamp::new(35));

        let message2 = deserializer.get_next_message(&chunk2).unwrap().unwrap();
        assert_eq!(message2.type_id, 4);
        assert_eq!(message2.timestamp, RtmpTimestamp::new(46));

        let message3 = deserializer.get_next_message(&chunk3).unwrap().unwrap();
        assert_eq!(message3.timestamp, RtmpTimestamp::new(57));
    }

    #[test]
    fn can_read_message_split_across_multiple_calls() {
        let payload = [1_u8, 2, 3];
        let bytes = type_0_chunk(50, 25, 5, 3, &payload, 128);
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut deserializer = ChunkDeserializer::new();
        assert!(deserializer.get_next_message(first).unwrap().is_none());

        let result = deserializer.get_next_message(second).unwrap().unwrap();
        assert_eq!(&result.data[..], &payload[..]);
    }

    #[test]
    fn can_read_message_exceeding_max_chunk_size() {
        let payload = [100_u8; 500];
        let bytes = type_0_chunk(50, 25, 5, 3, &payload, 100);

        let mut deserializer = ChunkDeserializer::new();
        deserializer.set_max_chunk_size(100).unwrap();

        let result = deserializer.get_next_message(&bytes).unwrap().unwrap();
        assert_eq!(&result.data[..], &payload[..]);
    }

    #[test]
    fn reassembled_length_matches_sum_of_chunk_payload_slices() {
        // Three chunk-sized slices of 100 plus a tail of 23
        let payload = [7_u8; 323];
        let bytes = type_0_chunk(50, 25, 5, 9, &payload, 100);

        let mut deserializer = ChunkDeserializer::new();
        deserializer.set_max_chunk_size(100).unwrap();

        let result = deserializer.get_next_message(&bytes).unwrap().unwrap();
        assert_eq!(result.data.len(), 323);
    }

    #[test]
    fn error_when_setting_chunk_size_out_of_bounds() {
        let mut deserializer = ChunkDeserializer::new();

        match deserializer.set_max_chunk_size(65537) {
            Err(ChunkDeserializationError::InvalidMaxChunkSize { chunk_size: 65537 }) => (),
            x => panic!("Expected InvalidMaxChunkSize, got {:?}", x),
        }

        match deserializer.set_max_chunk_size(0) {
            Err(ChunkDeserializationError::InvalidMaxChunkSize { chunk_size: 0 }) => (),
            x => panic!("Expected InvalidMaxChunkSize, got {:?}", x),
        }
    }

    #[test]
    fn error_when_compressed_header_has_no_previous_chunk() {
        let chunk = type_2_chunk(50, 10, &[1, 2, 3]);
        let mut deserializer = ChunkDeserializer::new();

        match deserializer.get_next_message(&chunk) {
            Err(ChunkDeserializationError::NoPreviousChunkOnStream { csid: 50 }) => (),
            x => panic!("Expected NoPreviousChunkOnStream, got {:?}", x),
        }
    }

    #[test]
    fn type_3_continuation_of_split_message_does_not_reapply_delta() {
        // OBS sends a type 1 chunk with a delta for a video message, then
        // continues the same message with type 3 chunks.  The delta must not
        // be applied per continuation chunk.
        let chunk1 = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x09, 0x01, 0x00, 0x00, 0x00, 0x01,
        ];
        let chunk2 = [
            0x44, 0x00, 0x00, 0x21, 0x00, 0x00, 0x05, 0x09, 0x01, 0x02, 0x03, 0x04, 0xc4, 0x05,
        ];

        let mut deserializer = ChunkDeserializer::new();
        deserializer.set_max_chunk_size(4).unwrap();

        let payload1 = deserializer.get_next_message(&chunk1).unwrap().unwrap();
        assert_eq!(payload1.timestamp, RtmpTimestamp::new(0));
        assert_eq!(&payload1.data[..], &[0x01]);

        let payload2 = deserializer.get_next_message(&chunk2).unwrap().unwrap();
        assert_eq!(payload2.timestamp, RtmpTimestamp::new(33));
        assert_eq!(&payload2.data[..], &[0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn type_3_chunk_following_extended_timestamp_repeats_the_field() {
        let chunk1 = [
            0x06, 0xff, 0xff, 0xff, 0x00, 0x00, 0x07, 0x09, 0x01, 0x00, 0x00, 0x00, 0x01, 0xff,
            0xff, 0xff, 0x01, 0x02, 0x03, 0x04,
        ];
        let chunk2 = [0xc6, 0x01, 0xff, 0xff, 0xff, 0x05, 0x06, 0x07];

        let mut deserializer = ChunkDeserializer::new();
        deserializer.set_max_chunk_size(4).unwrap();

        let _ = deserializer.get_next_message(&chunk1).unwrap();
        let payload = deserializer.get_next_message(&chunk2).unwrap().unwrap();

        assert_eq!(payload.timestamp, RtmpTimestamp::new(0x1ffffff));
        assert_eq!(&payload.data[..], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
    }
}
