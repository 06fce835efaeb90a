use super::chunk_header::{ChunkHeader, ChunkHeaderFormat};
use super::{ChunkSerializationError, INITIAL_MAX_CHUNK_SIZE, MAX_NEGOTIABLE_CHUNK_SIZE};
use crate::messages::{MessagePayload, RtmpMessage};
use crate::time::RtmpTimestamp;
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::cmp::min;
use std::collections::HashMap;
use std::io::{Cursor, Write};

const MAX_INITIAL_TIMESTAMP: u32 = 0xFFFFFF;

/// An outbound unit containing at least one RTMP chunk with a single RTMP
/// message.  Audio and video packets are flagged droppable so that a relayer
/// under back-pressure may shed them; a packet that may have been dropped
/// forces the next chunk on its stream to carry a full header.
#[derive(Debug, PartialEq)]
pub struct Packet {
    pub bytes: Vec<u8>,
    pub can_be_dropped: bool,
}

/// Serializes RTMP messages into RTMP chunks.
///
/// Headers are compressed against the previous chunk sent on the same chunk
/// stream, so the same serializer must produce every byte sent to a peer.
pub struct ChunkSerializer {
    previous_headers: HashMap<u32, ChunkHeader>,
    max_chunk_size: u32,
}

impl ChunkSerializer {
    pub fn new() -> ChunkSerializer {
        ChunkSerializer {
            previous_headers: HashMap::new(),
            max_chunk_size: INITIAL_MAX_CHUNK_SIZE,
        }
    }

    /// Forms the `SetChunkSize` packet for the new size and starts slicing
    /// subsequent messages accordingly.
    pub fn set_max_chunk_size(
        &mut self,
        new_size: u32,
        time: RtmpTimestamp,
    ) -> Result<Packet, ChunkSerializationError> {
        if new_size == 0 || new_size > MAX_NEGOTIABLE_CHUNK_SIZE {
            return Err(ChunkSerializationError::InvalidMaxChunkSize {
                chunk_size: new_size,
            });
        }

        let message = RtmpMessage::SetChunkSize { size: new_size };
        let payload = MessagePayload::from_rtmp_message(message, time, 0)?;
        let packet = self.serialize(&payload, true, false)?;

        self.max_chunk_size = new_size;
        Ok(packet)
    }

    pub fn serialize(
        &mut self,
        message: &MessagePayload,
        force_uncompressed: bool,
        can_be_dropped: bool,
    ) -> Result<Packet, ChunkSerializationError> {
        if message.data.len() > MAX_INITIAL_TIMESTAMP as usize {
            return Err(ChunkSerializationError::MessageTooLong {
                size: message.data.len() as u32,
            });
        }

        let mut header = ChunkHeader {
            chunk_stream_id: csid_for_message_type(message.type_id),
            timestamp: message.timestamp,
            timestamp_field: 0,
            timestamp_delta: 0,
            message_type_id: message.type_id,
            message_stream_id: message.message_stream_id,
            message_length: message.data.len() as u32,
            can_be_dropped,
        };

        let format = if force_uncompressed {
            ChunkHeaderFormat::Full
        } else {
            match self.previous_headers.get(&header.chunk_stream_id) {
                None => ChunkHeaderFormat::Full,
                Some(previous) => {
                    if previous.can_be_dropped {
                        // The peer may never have seen the previous chunk, so
                        // nothing can be delta compressed against it.
                        ChunkHeaderFormat::Full
                    } else {
                        header.timestamp_delta = (header.timestamp - previous.timestamp).value;
                        pick_format(&header, previous)
                    }
                }
            }
        };

        let mut bytes = Cursor::new(Vec::new());
        let mut first = true;
        for slice in message.data.chunks(self.max_chunk_size as usize) {
            if first {
                write_chunk(&mut bytes, &format, &header, slice)?;
                first = false;
            } else {
                write_chunk(&mut bytes, &ChunkHeaderFormat::Empty, &header, slice)?;
            }
        }

        if message.data.is_empty() {
            write_chunk(&mut bytes, &format, &header, &[])?;
        }

        self.previous_headers.insert(header.chunk_stream_id, header);

        Ok(Packet {
            bytes: bytes.into_inner(),
            can_be_dropped,
        })
    }
}

fn pick_format(current: &ChunkHeader, previous: &ChunkHeader) -> ChunkHeaderFormat {
    if current.message_stream_id != previous.message_stream_id {
        return ChunkHeaderFormat::Full;
    }

    if current.message_type_id != previous.message_type_id
        || current.message_length != previous.message_length
    {
        return ChunkHeaderFormat::TimeDeltaWithoutMessageStreamId;
    }

    if current.timestamp_delta != previous.timestamp_delta {
        return ChunkHeaderFormat::TimeDeltaOnly;
    }

    ChunkHeaderFormat::Empty
}

fn write_chunk(
    bytes: &mut Cursor<Vec<u8>>,
    format: &ChunkHeaderFormat,
    header: &ChunkHeader,
    payload: &[u8],
) -> Result<(), ChunkSerializationError> {
    write_basic_header(bytes, format, header.chunk_stream_id)?;

    let time_value = match *format {
        ChunkHeaderFormat::Full => header.timestamp.value,
        _ => header.timestamp_delta,
    };

    if *format != ChunkHeaderFormat::Empty {
        bytes.write_u24::<BigEndian>(min(time_value, MAX_INITIAL_TIMESTAMP))?;
    }

    if *format == ChunkHeaderFormat::Full
        || *format == ChunkHeaderFormat::TimeDeltaWithoutMessageStreamId
    {
        bytes.write_u24::<BigEndian>(header.message_length)?;
        bytes.write_u8(header.message_type_id)?;
    }

    if *format == ChunkHeaderFormat::Full {
        bytes.write_u32::<LittleEndian>(header.message_stream_id)?;
    }

    if *format != ChunkHeaderFormat::Empty && time_value >= MAX_INITIAL_TIMESTAMP {
        bytes.write_u32::<BigEndian>(time_value)?;
    }

    bytes.write_all(payload)?;
    Ok(())
}

fn write_basic_header(
    bytes: &mut Cursor<Vec<u8>>,
    format: &ChunkHeaderFormat,
    csid: u32,
) -> Result<(), ChunkSerializationError> {
    debug_assert!(
        (2..65600).contains(&csid),
        "chunk stream ids must be between 2 and 65599, got {}",
        csid
    );

    let format_mask = match *format {
        ChunkHeaderFormat::Full => 0b0000_0000,
        ChunkHeaderFormat::TimeDeltaWithoutMessageStreamId => 0b0100_0000,
        ChunkHeaderFormat::TimeDeltaOnly => 0b1000_0000,
        ChunkHeaderFormat::Empty => 0b1100_0000,
    };

    if csid < 64 {
        bytes.write_u8(format_mask | csid as u8)?;
    } else if csid < 320 {
        bytes.write_u8(format_mask)?;
        bytes.write_u8((csid - 64) as u8)?;
    } else {
        bytes.write_u8(format_mask | 1)?;
        bytes.write_u16::<LittleEndian>((csid - 64) as u16)?;
    }

    Ok(())
}

/// Spreads repeated message types over distinct chunk streams so their
/// headers compress against each other.
fn csid_for_message_type(message_type_id: u8) -> u32 {
    match message_type_id {
        1..=6 => 2,
        18 | 19 => 3,
        9 => 4,
        8 => 5,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use byteorder::ReadBytesExt;
    use std::io::Read;

    fn payload_with(timestamp: u32, type_id: u8, stream_id: u32, data: Vec<u8>) -> MessagePayload {
        MessagePayload {
            timestamp: RtmpTimestamp::new(timestamp),
            type_id,
            message_stream_id: stream_id,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn first_message_gets_type_0_chunk() {
        let message = payload_with(72, 50, 12, vec![1, 2, 3, 4]);

        let mut serializer = ChunkSerializer::new();
        let packet = serializer.serialize(&message, false, false).unwrap();

        let mut cursor = Cursor::new(packet.bytes);
        let first_byte = cursor.read_u8().unwrap();
        assert_eq!(first_byte >> 6, 0, "expected format 0");
        assert_eq!(first_byte & 0x3F, 6, "expected csid 6");

        assert_eq!(cursor.read_u24::<BigEndian>().unwrap(), 72);
        assert_eq!(cursor.read_u24::<BigEndian>().unwrap(), 4);
        assert_eq!(cursor.read_u8().unwrap(), 50);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 12);

        let mut data = Vec::new();
        cursor.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn second_message_with_same_everything_but_time_gets_type_2_chunk() {
        let message1 = payload_with(72, 50, 12, vec![1, 2, 3, 4]);
        let message2 = payload_with(82, 50, 12, vec![5, 6, 7, 8]);

        let mut serializer = ChunkSerializer::new();
        let _ = serializer.serialize(&message1, false, false).unwrap();
        let packet = serializer.serialize(&message2, false, false).unwrap();

        let mut cursor = Cursor::new(packet.bytes);
        let first_byte = cursor.read_u8().unwrap();
        assert_eq!(first_byte >> 6, 2, "expected format 2");
        assert_eq!(cursor.read_u24::<BigEndian>().unwrap(), 10, "expected delta");
    }

    #[test]
    fn repeated_identical_deltas_get_type_3_chunk() {
        let message1 = payload_with(72, 50, 12, vec![1, 2, 3, 4]);
        let message2 = payload_with(82, 50, 12, vec![5, 6, 7, 8]);
        let message3 = payload_with(92, 50, 12, vec![9, 10, 11, 12]);

        let mut serializer = ChunkSerializer::new();
        let _ = serializer.serialize(&message1, false, false).unwrap();
        let _ = serializer.serialize(&message2, false, false).unwrap();
        let packet = serializer.serialize(&message3, false, false).unwrap();

        let mut cursor = Cursor::new(packet.bytes);
        let first_byte = cursor.read_u8().unwrap();
        assert_eq!(first_byte >> 6, 3, "expected format 3");
    }

    #[test]
    fn changed_length_gets_type_1_chunk() {
        let message1 = payload_with(72, 50, 12, vec![1, 2, 3, 4]);
        let message2 = payload_with(82, 50, 12, vec![5, 6, 7]);

        let mut serializer = ChunkSerializer::new();
        let _ = serializer.serialize(&message1, false, false).unwrap();
        let packet = serializer.serialize(&message2, false, false).unwrap();

        let mut cursor = Cursor::new(packet.bytes);
        let first_byte = cursor.read_u8().unwrap();
        assert_eq!(first_byte >> 6, 1, "expected format 1");
    }

    #[test]
    fn message_larger_than_chunk_size_gets_continuation_headers() {
        let message = payload_with(72, 50, 12, vec![9_u8; 300]);

        let mut serializer = ChunkSerializer::new();
        let packet = serializer.serialize(&message, false, false).unwrap();

        // 12 byte type 0 header + 128 payload + 1 byte type 3 header + 128
        // payload + 1 byte type 3 header + 44 payload
        assert_eq!(packet.bytes.len(), 12 + 128 + 1 + 128 + 1 + 44);
        assert_eq!(packet.bytes[12 + 128] >> 6, 3);
        assert_eq!(packet.bytes[12 + 128 + 1 + 128] >> 6, 3);
    }

    #[test]
    fn message_after_droppable_packet_gets_full_header() {
        let message1 = payload_with(72, 50, 12, vec![1, 2, 3, 4]);
        let message2 = payload_with(82, 50, 12, vec![5, 6, 7, 8]);

        let mut serializer = ChunkSerializer::new();
        let _ = serializer.serialize(&message1, false, true).unwrap();
        let packet = serializer.serialize(&message2, false, false).unwrap();

        assert_eq!(packet.bytes[0] >> 6, 0, "expected format 0");
    }

    #[test]
    fn set_chunk_size_packet_takes_effect_for_later_messages() {
        let mut serializer = ChunkSerializer::new();
        let packet = serializer
            .set_max_chunk_size(4096, RtmpTimestamp::new(0))
            .unwrap();
        assert!(!packet.bytes.is_empty());

        let message = payload_with(72, 50, 12, vec![9_u8; 300]);
        let data_packet = serializer.serialize(&message, false, false).unwrap();

        // Fits one chunk now
        assert_eq!(data_packet.bytes.len(), 12 + 300);
    }

    #[test]
    fn error_when_message_exceeds_24_bit_length() {
        let message = payload_with(72, 50, 12, vec![0_u8; 16777216]);

        let mut serializer = ChunkSerializer::new();
        match serializer.serialize(&message, false, false) {
            Err(ChunkSerializationError::MessageTooLong { size: 16777216 }) => (),
            x => panic!("Expected MessageTooLong, got {:?}", x),
        }
    }

    #[test]
    fn serialized_messages_round_trip_through_the_deserializer() {
        use crate::chunk_io::ChunkDeserializer;

        let inputs = vec![
            payload_with(55, 15, 1, vec![1, 2, 3, 4, 5, 6]),
            payload_with(65, 15, 1, vec![8, 9, 10]),
            payload_with(75, 15, 1, vec![1, 2, 3]),
        ];

        let mut serializer = ChunkSerializer::new();
        let mut all_bytes = Vec::new();
        for input in &inputs {
            all_bytes.extend(serializer.serialize(input, false, false).unwrap().bytes);
        }

        let mut deserializer = ChunkDeserializer::new();
        let mut outputs = Vec::new();
        let mut to_process: &[u8] = &all_bytes;
        while let Some(message) = deserializer.get_next_message(to_process).unwrap() {
            outputs.push(message);
            to_process = &[];
        }

        assert_eq!(inputs, outputs);
    }
}
