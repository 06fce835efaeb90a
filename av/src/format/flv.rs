//! FLV tag demuxing and remuxing.
//!
//! The demuxer walks the 13 byte file header and then each
//! `<backpointer><tag header><payload>` record byte by byte, so input can be
//! appended in arbitrary slices.  The remuxer turns stream packets back into
//! tags, rebasing timestamps on the first keyframe it observed.

use super::{
    event_type, mode, MediaStream, MediaStreamTrack, Remuxer, StreamEvent, StreamEventKind,
    REMUX_INACTIVE, REMUX_PUMPING, REMUX_WAITING,
};
use crate::events::{EventDispatcher, EventListener};
use crate::packet::{Packet, PacketKind, Side};
use bytes::Bytes;
use lml_amf0::Amf0Value;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// FLV tag kinds
pub const TAG_AUDIO: u8 = 0x08;
pub const TAG_VIDEO: u8 = 0x09;
pub const TAG_SCRIPT: u8 = 0x12;

/// FLV audio codec ids (high nibble of the first payload byte)
pub const CODEC_AAC: u8 = 0x0A;

/// FLV video codec ids (low nibble of the first payload byte)
pub const CODEC_AVC: u8 = 0x07;

/// RTMP/FLV video frame types
pub const KEYFRAME: u8 = 0x1;
pub const GENERATED_KEYFRAME: u8 = 0x4;

/// FLV sample rates by the 2 bit rate code
pub const RATES: [u32; 4] = [5500, 11025, 22050, 44100];

/// The payload of a synthetic end-of-sequence video tag
pub const FOOTER: [u8; 5] = [0x17, 0x02, 0x00, 0x00, 0x00];

/// The 13 byte FLV file header for the given mode flags
pub fn header(mode_flags: u32) -> Vec<u8> {
    let mut flags = 0_u8;
    if (mode_flags & mode::VIDEO) != 0 {
        flags |= 0x01;
    }
    if (mode_flags & mode::AUDIO) != 0 {
        flags |= 0x04;
    }

    vec![
        b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxStage {
    Signature(usize),
    Version,
    Flags,
    HeaderRemainder(usize),
    Backpointer(usize),
    TagType,
    Length(usize),
    Timestamp(usize),
    StreamId(usize),
    Payload,
    Failed,
}

struct DemuxState {
    stage: DemuxStage,
    has_audio: bool,
    has_video: bool,
    backpointer: u32,
    kind: PacketKind,
    length: u32,
    timestamp: u32,
    stream_id: u32,
    payload: Vec<u8>,
}

impl DemuxState {
    fn new() -> DemuxState {
        DemuxState {
            stage: DemuxStage::Signature(0),
            has_audio: false,
            has_video: false,
            backpointer: 0,
            kind: PacketKind::Script,
            length: 0,
            timestamp: 0,
            stream_id: 0,
            payload: Vec::new(),
        }
    }
}

struct AttachState {
    source: Option<Arc<MediaStream>>,
    attached_sources: Vec<Arc<MediaStreamTrack>>,
    packet_listener: Option<Arc<EventListener<StreamEvent>>>,
    add_track_listener: Option<Arc<EventListener<StreamEvent>>>,
    remove_track_listener: Option<Arc<EventListener<StreamEvent>>>,
    error_listener: Option<Arc<EventListener<StreamEvent>>>,
    close_listener: Option<Arc<EventListener<StreamEvent>>>,
}

/// The FLV demuxer / remuxer
pub struct Flv {
    mode: u32,
    out: Arc<MediaStream>,
    state: AtomicU32,
    time_base: AtomicU32,
    last_timestamp: AtomicU32,
    demux: Mutex<DemuxState>,
    attach_state: Mutex<AttachState>,
}

impl Flv {
    pub fn new(mode: u32) -> Arc<Flv> {
        Arc::new(Flv {
            mode,
            out: MediaStream::new(),
            state: AtomicU32::new(REMUX_INACTIVE),
            time_base: AtomicU32::new(0),
            last_timestamp: AtomicU32::new(0),
            demux: Mutex::new(DemuxState::new()),
            attach_state: Mutex::new(AttachState {
                source: None,
                attached_sources: Vec::new(),
                packet_listener: None,
                add_track_listener: None,
                remove_track_listener: None,
                error_listener: None,
                close_listener: None,
            }),
        })
    }

    /// The output side stream model: cloned tracks plus relayed dataframes
    pub fn output(&self) -> &Arc<MediaStream> {
        &self.out
    }

    /// Parses appended FLV bytes, emitting a packet event per complete tag
    pub fn append(&self, data: &[u8]) {
        let mut demux = self.demux.lock();
        let size = data.len();
        let mut i = 0;

        while i < size {
            let byte = data[i];

            match demux.stage {
                DemuxStage::Signature(index) => {
                    let expected = [b'F', b'L', b'V'][index];
                    if byte != expected {
                        drop(demux);
                        self.demux_error(format!("not {:?}", expected as char));
                        return;
                    }
                    demux.stage = if index == 2 {
                        DemuxStage::Version
                    } else {
                        DemuxStage::Signature(index + 1)
                    };
                }

                DemuxStage::Version => {
                    // Version mismatches are tolerated
                    demux.stage = DemuxStage::Flags;
                }

                DemuxStage::Flags => {
                    demux.has_audio = (byte & 0x04) == 0x04;
                    demux.has_video = (byte & 0x01) == 0x01;
                    demux.stage = DemuxStage::HeaderRemainder(4);
                }

                DemuxStage::HeaderRemainder(remaining) => {
                    // The u32 header size field; its value is fixed
                    demux.stage = if remaining == 1 {
                        DemuxStage::Backpointer(4)
                    } else {
                        DemuxStage::HeaderRemainder(remaining - 1)
                    };
                }

                DemuxStage::Backpointer(remaining) => {
                    demux.backpointer = (demux.backpointer << 8) | byte as u32;
                    demux.stage = if remaining == 1 {
                        DemuxStage::TagType
                    } else {
                        DemuxStage::Backpointer(remaining - 1)
                    };
                }

                DemuxStage::TagType => {
                    demux.kind = match byte {
                        TAG_AUDIO => PacketKind::Audio,
                        TAG_VIDEO => PacketKind::Video,
                        TAG_SCRIPT => PacketKind::Script,
                        x => {
                            drop(demux);
                            self.demux_error(format!("unrecognized flv tag 0x{:02X}", x));
                            return;
                        }
                    };
                    demux.length = 0;
                    demux.stage = DemuxStage::Length(3);
                }

                DemuxStage::Length(remaining) => {
                    demux.length = (demux.length << 8) | byte as u32;
                    demux.stage = if remaining == 1 {
                        demux.timestamp = 0;
                        demux.payload = Vec::with_capacity(demux.length as usize);
                        DemuxStage::Timestamp(4)
                    } else {
                        DemuxStage::Length(remaining - 1)
                    };
                }

                DemuxStage::Timestamp(remaining) => {
                    // Three low bytes first, then the extension byte on top
                    if remaining == 1 {
                        demux.timestamp |= (byte as u32) << 24;
                        demux.stream_id = 0;
                        demux.stage = DemuxStage::StreamId(3);
                    } else {
                        demux.timestamp =
                            (demux.timestamp << 8) | byte as u32;
                        demux.stage = DemuxStage::Timestamp(remaining - 1);
                    }
                }

                DemuxStage::StreamId(remaining) => {
                    demux.stream_id = (demux.stream_id << 8) | byte as u32;
                    if remaining == 1 {
                        if demux.length == 0 {
                            // A zero length tag completes immediately
                            drop(demux);
                            self.finish_demuxed_tag();
                            demux = self.demux.lock();
                            demux.backpointer = 0;
                            demux.stage = DemuxStage::Backpointer(4);
                        } else {
                            demux.stage = DemuxStage::Payload;
                        }
                    } else {
                        demux.stage = DemuxStage::StreamId(remaining - 1);
                    }
                }

                DemuxStage::Payload => {
                    let want = demux.length as usize - demux.payload.len();
                    let take = want.min(size - i);
                    demux.payload.extend_from_slice(&data[i..i + take]);
                    i += take;

                    if demux.payload.len() == demux.length as usize {
                        drop(demux);
                        self.finish_demuxed_tag();
                        demux = self.demux.lock();
                        demux.backpointer = 0;
                        demux.stage = DemuxStage::Backpointer(4);
                    }
                    continue;
                }

                DemuxStage::Failed => return,
            }

            i += 1;
        }
    }

    fn finish_demuxed_tag(&self) {
        let (kind, timestamp, stream_id, payload) = {
            let mut demux = self.demux.lock();
            let payload = std::mem::take(&mut demux.payload);
            (demux.kind, demux.timestamp, demux.stream_id, payload)
        };

        let mut packet = Packet::new(kind, Bytes::from(payload));
        packet.timestamp = timestamp;
        packet.stream_id = stream_id;

        match kind {
            PacketKind::Audio => {
                if packet.payload.len() < 2 {
                    self.demux_error("short audio tag".to_string());
                    return;
                }

                let first = packet.payload[0];
                if (first >> 4) == CODEC_AAC {
                    packet.codec = "AAC";
                }

                packet.side = Side::Audio {
                    sample_rate: (first >> 2) & 0x03,
                    sample_size: (first >> 1) & 0x01,
                    sample_type: first & 0x01,
                    data_type: packet.payload[1],
                    dts: timestamp,
                    pts: timestamp,
                    data: packet.payload.slice(2..),
                };
                packet.position = 1;
            }

            PacketKind::Video => {
                if packet.payload.len() < 2 {
                    self.demux_error("short video tag".to_string());
                    return;
                }

                let first = packet.payload[0];
                let frame_type = (first >> 4) & 0x0F;
                if (first & 0x0F) == CODEC_AVC {
                    packet.codec = "AVC";
                }

                packet.side = Side::Video {
                    frame_type,
                    data_type: packet.payload[1],
                    cts: 0,
                    dts: timestamp,
                    pts: timestamp,
                    keyframe: frame_type == KEYFRAME || frame_type == GENERATED_KEYFRAME,
                    nalu_type: 0,
                    nalus: Vec::new(),
                    data: packet.payload.slice(2..),
                };
                packet.position = 1;
            }

            PacketKind::Script => {
                let mut cursor = Cursor::new(&packet.payload[..]);
                if let Ok(mut values) = lml_amf0::deserialize(&mut cursor) {
                    if values.len() >= 2 {
                        if let Amf0Value::Utf8String(key) = values.remove(0) {
                            packet.side = Side::Script {
                                handler: String::new(),
                                key,
                                value: values.remove(0),
                            };
                        }
                    }
                }
            }
        }

        let mut event = StreamEvent::packet(Arc::new(packet));
        self.out.events().dispatch_event(event_type::PACKET, &mut event);
    }

    fn demux_error(&self, message: String) {
        self.demux.lock().stage = DemuxStage::Failed;
        error!(%message, "flv demux error");

        let mut event = StreamEvent::error("DataError", message);
        self.out.events().dispatch_event(event_type::ERROR, &mut event);
    }

    /// Formats a stream packet into a complete FLV tag with back-pointer
    pub fn format_tag(&self, packet: &Packet) -> Packet {
        let time_base = self.time_base.load(Ordering::Acquire);
        let length = packet.payload.len() as u32;
        let backpointer = length + 11;
        let timestamp = packet.timestamp.wrapping_sub(time_base);

        let kind = match packet.kind {
            PacketKind::Audio => TAG_AUDIO,
            PacketKind::Video => TAG_VIDEO,
            PacketKind::Script => TAG_SCRIPT,
        };

        let mut bytes = Vec::with_capacity(backpointer as usize + 4);
        bytes.extend_from_slice(&[
            kind,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
            (timestamp >> 16) as u8,
            (timestamp >> 8) as u8,
            timestamp as u8,
            (timestamp >> 24) as u8,
            0x00,
            0x00,
            0x00, // stream id is always 0
        ]);
        bytes.extend_from_slice(&packet.payload);
        bytes.extend_from_slice(&backpointer.to_be_bytes());

        let mut tag = packet.with_payload(Bytes::from(bytes));
        tag.timestamp = timestamp;
        tag
    }

    fn emit(&self, packet: Packet) {
        let mut event = StreamEvent::packet(Arc::new(packet));
        self.out.events().dispatch_event(event_type::PACKET, &mut event);
    }

    fn wants_track(&self, track: &MediaStreamTrack) -> bool {
        match track.kind() {
            super::TrackKind::Audio => (self.mode & mode::AUDIO) != 0,
            super::TrackKind::Video => (self.mode & mode::VIDEO) != 0,
        }
    }

    fn on_packet(&self, packet: Arc<Packet>) {
        match packet.kind {
            PacketKind::Audio => self.on_audio_packet(packet),
            PacketKind::Video => self.on_video_packet(packet),
            PacketKind::Script => self.on_data_packet(packet),
        }
    }

    fn on_audio_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AAC" {
            error!(codec = packet.codec, "unrecognized audio codec");
            return;
        }

        // Without a video path there is no keyframe to anchor the time base,
        // so the first audio frame does it
        if (self.mode & mode::VIDEO) == 0
            && self
                .state
                .compare_exchange(
                    REMUX_WAITING,
                    REMUX_PUMPING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.time_base.store(packet.timestamp, Ordering::Release);
        }

        let track = match self.out.audio_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        if track.source().info_frame().is_none()
            || self.state.load(Ordering::Acquire) != REMUX_PUMPING
        {
            return;
        }

        self.last_timestamp.store(packet.timestamp, Ordering::Release);
        let tag = self.format_tag(&packet);
        self.emit(tag);
    }

    fn on_video_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AVC" {
            error!(codec = packet.codec, "unrecognized video codec");
            return;
        }

        let keyframe = match &packet.side {
            Side::Video { keyframe, .. } => *keyframe,
            _ => false,
        };

        if keyframe
            && self
                .state
                .compare_exchange(
                    REMUX_WAITING,
                    REMUX_PUMPING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.time_base.store(packet.timestamp, Ordering::Release);
        }

        let track = match self.out.video_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        if track.source().info_frame().is_none()
            || self.state.load(Ordering::Acquire) != REMUX_PUMPING
            || ((self.mode & mode::KEYFRAME) == mode::KEYFRAME && !keyframe)
        {
            return;
        }

        self.last_timestamp.store(packet.timestamp, Ordering::Release);
        let tag = self.format_tag(&packet);
        self.emit(tag);
    }

    fn on_data_packet(&self, packet: Arc<Packet>) {
        let key = match &packet.side {
            Side::Script { key, .. } => key.clone(),
            _ => return,
        };

        self.out.set_data_frame(&key, packet.clone());

        if key != "onMetaData" {
            debug!(%key, "ignored data frame");
            return;
        }

        let tag = self.format_tag(&packet);
        self.emit(tag);
    }

    fn on_add_track(&self, track: Arc<MediaStreamTrack>, packet_listener: Arc<EventListener<StreamEvent>>) {
        if !self.wants_track(&track) {
            return;
        }

        if self.out.attached(track.source()).is_none() {
            let clone = track.clone_track();
            self.out.add_track(clone);
            track
                .source()
                .events()
                .add_event_listener(event_type::PACKET, packet_listener);
            self.attach_state.lock().attached_sources.push(track);
        }
    }

    fn on_remove_track(&self, track: Arc<MediaStreamTrack>, packet_listener: &Arc<EventListener<StreamEvent>>) {
        if let Some(attached) = self.out.attached(track.source()) {
            track
                .source()
                .events()
                .remove_event_listener(event_type::PACKET, packet_listener);
            self.out.remove_track(&attached);
        }
    }
}

impl Remuxer for Flv {
    fn mode(&self) -> u32 {
        self.mode
    }

    fn events(&self) -> &EventDispatcher<StreamEvent> {
        self.out.events()
    }

    fn attach(self: Arc<Self>, stream: &Arc<MediaStream>) {
        self.state.store(REMUX_WAITING, Ordering::Release);

        let weak = Arc::downgrade(&self);
        let packet_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(flv), StreamEventKind::Packet(packet)) =
                    (weak.upgrade(), &event.kind)
                {
                    flv.on_packet(packet.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let add_listener = packet_listener.clone();
        let add_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(flv), StreamEventKind::AddTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    flv.on_add_track(track.clone(), add_listener.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let remove_listener = packet_listener.clone();
        let remove_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(flv), StreamEventKind::RemoveTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    flv.on_remove_track(track.clone(), &remove_listener);
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let error_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(flv), StreamEventKind::Error { name, message }) =
                    (weak.upgrade(), &event.kind)
                {
                    debug!(%name, %message, "source stream error");
                    flv.close();
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let close_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(flv), StreamEventKind::Close) = (weak.upgrade(), &event.kind) {
                    flv.close();
                }
            },
            0,
        );

        // Replay the last onMetaData for this late subscriber
        if let Some(metadata) = stream.get_data_frame("onMetaData") {
            self.out.set_data_frame("onMetaData", metadata.clone());
            let tag = self.format_tag(&metadata);
            self.emit(tag);
        }

        for track in stream.get_tracks() {
            if !self.wants_track(&track) {
                continue;
            }

            let clone = track.clone_track();
            self.out.add_track(clone);

            if let Some(info_frame) = track.source().info_frame() {
                let tag = self.format_tag(&info_frame);
                self.emit(tag);
            }

            track
                .source()
                .events()
                .add_event_listener(event_type::PACKET, packet_listener.clone());
            self.attach_state.lock().attached_sources.push(track.clone());
        }

        stream
            .events()
            .add_event_listener(event_type::ADD_TRACK, add_track_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::REMOVE_TRACK, remove_track_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::PACKET, packet_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::ERROR, error_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::CLOSE, close_listener.clone());

        let mut attach_state = self.attach_state.lock();
        attach_state.source = Some(stream.clone());
        attach_state.packet_listener = Some(packet_listener);
        attach_state.add_track_listener = Some(add_track_listener);
        attach_state.remove_track_listener = Some(remove_track_listener);
        attach_state.error_listener = Some(error_listener);
        attach_state.close_listener = Some(close_listener);
    }

    fn close(&self) {
        let previous = self.state.swap(REMUX_INACTIVE, Ordering::AcqRel);
        if previous != REMUX_WAITING && previous != REMUX_PUMPING {
            return;
        }

        // Terminate an active video path with an end-of-sequence tag
        if previous == REMUX_PUMPING && !self.out.video_tracks().is_empty() {
            let mut footer = Packet::new(PacketKind::Video, Bytes::from(FOOTER.to_vec()));
            footer.codec = "AVC";
            footer.timestamp = self.last_timestamp.load(Ordering::Acquire);
            let tag = self.format_tag(&footer);
            self.emit(tag);
        }

        let mut event = StreamEvent::close();
        self.out.events().dispatch_event(event_type::CLOSE, &mut event);

        let mut attach_state = self.attach_state.lock();
        if let Some(packet_listener) = attach_state.packet_listener.take() {
            for track in attach_state.attached_sources.drain(..) {
                track
                    .source()
                    .events()
                    .remove_event_listener(event_type::PACKET, &packet_listener);
            }

            if let Some(stream) = attach_state.source.take() {
                stream
                    .events()
                    .remove_event_listener(event_type::PACKET, &packet_listener);

                if let Some(listener) = attach_state.add_track_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::ADD_TRACK, &listener);
                }
                if let Some(listener) = attach_state.remove_track_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::REMOVE_TRACK, &listener);
                }
                if let Some(listener) = attach_state.error_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::ERROR, &listener);
                }
                if let Some(listener) = attach_state.close_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::CLOSE, &listener);
                }
            }
        }
        drop(attach_state);

        self.out.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn collect_packets(flv: &Arc<Flv>) -> Arc<PlMutex<Vec<Packet>>> {
        let seen: Arc<PlMutex<Vec<Packet>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        flv.out.events().add_event_listener(
            event_type::PACKET,
            EventListener::new(
                move |event: &mut StreamEvent| {
                    if let StreamEventKind::Packet(packet) = &event.kind {
                        sink.lock().push((**packet).clone());
                    }
                },
                0,
            ),
        );
        seen
    }

    fn tag_bytes(kind: u8, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let length = payload.len() as u32;
        let mut bytes = vec![
            kind,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
            (timestamp >> 16) as u8,
            (timestamp >> 8) as u8,
            timestamp as u8,
            (timestamp >> 24) as u8,
            0,
            0,
            0,
        ];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn flv_file(tags: &[(u8, u32, Vec<u8>)]) -> Vec<u8> {
        let mut file = header(mode::ALL);
        for (kind, timestamp, payload) in tags {
            let tag = tag_bytes(*kind, *timestamp, payload);
            file.extend_from_slice(&tag);
            file.extend_from_slice(&((tag.len() as u32).to_be_bytes()));
        }
        file
    }

    #[test]
    fn demuxes_audio_and_video_tags() {
        let flv = Flv::new(mode::ALL);
        let seen = collect_packets(&flv);

        let audio_payload = vec![0xAF, 0x01, 0x11, 0x22];
        let video_payload = vec![0x17, 0x01, 0x00, 0x00, 0x00, 0x99];
        let file = flv_file(&[
            (TAG_AUDIO, 10, audio_payload.clone()),
            (TAG_VIDEO, 20, video_payload.clone()),
        ]);

        flv.append(&file);

        let packets = seen.lock();
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0].kind, PacketKind::Audio);
        assert_eq!(packets[0].codec, "AAC");
        assert_eq!(packets[0].timestamp, 10);
        match &packets[0].side {
            Side::Audio {
                sample_rate: 3,
                sample_size: 1,
                sample_type: 1,
                data_type: 1,
                ..
            } => (),
            x => panic!("Unexpected audio side data: {:?}", x),
        }

        assert_eq!(packets[1].kind, PacketKind::Video);
        assert_eq!(packets[1].codec, "AVC");
        match &packets[1].side {
            Side::Video {
                frame_type: 1,
                data_type: 1,
                keyframe: true,
                ..
            } => (),
            x => panic!("Unexpected video side data: {:?}", x),
        }
    }

    #[test]
    fn demux_survives_byte_by_byte_input() {
        let flv = Flv::new(mode::ALL);
        let seen = collect_packets(&flv);

        let file = flv_file(&[(TAG_AUDIO, 5, vec![0xAF, 0x01, 0x42])]);
        for byte in file {
            flv.append(&[byte]);
        }

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn bad_signature_raises_a_data_error() {
        let flv = Flv::new(mode::ALL);

        let errors: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = errors.clone();
        flv.out.events().add_event_listener(
            event_type::ERROR,
            EventListener::new(
                move |event: &mut StreamEvent| {
                    if let StreamEventKind::Error { name, .. } = &event.kind {
                        sink.lock().push(name.clone());
                    }
                },
                0,
            ),
        );

        flv.append(b"GLV\x01\x05");
        assert_eq!(errors.lock().as_slice(), ["DataError"]);
    }

    #[test]
    fn format_tag_writes_header_payload_and_backpointer() {
        let flv = Flv::new(mode::ALL);

        let mut packet = Packet::new(PacketKind::Video, Bytes::from(vec![0x17_u8, 0x01, 0x00]));
        packet.timestamp = 0x012345;

        let tag = flv.format_tag(&packet);
        assert_eq!(tag.payload.len(), 11 + 3 + 4);
        assert_eq!(tag.payload[0], TAG_VIDEO);
        assert_eq!(&tag.payload[1..4], &[0x00, 0x00, 0x03]); // length
        assert_eq!(&tag.payload[4..8], &[0x01, 0x23, 0x45, 0x00]); // ts + ext
        assert_eq!(&tag.payload[14..18], &(14_u32).to_be_bytes()); // backpointer
    }

    #[test]
    fn format_tag_subtracts_the_time_base() {
        let flv = Flv::new(mode::ALL);
        flv.time_base.store(1000, Ordering::Release);

        let mut packet = Packet::new(PacketKind::Audio, Bytes::from(vec![0xAF_u8, 0x01]));
        packet.timestamp = 1500;

        let tag = flv.format_tag(&packet);
        assert_eq!(tag.timestamp, 500);
        assert_eq!(&tag.payload[4..7], &[0x00, 0x01, 0xF4]);
    }

    #[test]
    fn demux_then_remux_is_byte_identical_when_time_base_is_zero() {
        let source = Flv::new(mode::ALL);
        let sink = Flv::new(mode::ALL);

        let file = flv_file(&[
            (TAG_AUDIO, 0, vec![0xAF, 0x01, 0x10, 0x20, 0x30]),
            (TAG_VIDEO, 33, vec![0x17, 0x01, 0x00, 0x00, 0x00, 0x65, 0x11]),
            (TAG_AUDIO, 46, vec![0xAF, 0x01, 0x40]),
        ]);

        let rebuilt: Arc<PlMutex<Vec<u8>>> =
            Arc::new(PlMutex::new(header(mode::ALL)));
        let rebuilt_sink = rebuilt.clone();
        let remuxer = sink.clone();
        source.out.events().add_event_listener(
            event_type::PACKET,
            EventListener::new(
                move |event: &mut StreamEvent| {
                    if let StreamEventKind::Packet(packet) = &event.kind {
                        let tag = remuxer.format_tag(packet);
                        rebuilt_sink.lock().extend_from_slice(&tag.payload);
                    }
                },
                0,
            ),
        );

        source.append(&file);
        assert_eq!(*rebuilt.lock(), file);
    }
}
