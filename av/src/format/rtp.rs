//! RTP packetization: single NALU / STAP-A / FU-A for H.264 and AU-header
//! framing for AAC.

use super::{
    event_type, mode, MediaStream, MediaStreamTrack, Remuxer, StreamEvent, StreamEventKind,
    TrackKind, REMUX_INACTIVE, REMUX_PUMPING, REMUX_WAITING,
};
use crate::events::{EventDispatcher, EventListener};
use crate::packet::{Packet, PacketKind, Side};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

pub const VERSION: u8 = 2;
pub const MTU: usize = 1500;
pub const PAYLOAD_TYPE: u8 = 96;
pub const H264_FREQUENCY: u64 = 90_000;

/// NAL unit aggregation/fragmentation types
pub const NAL_STAP_A: u8 = 24;
pub const NAL_FU_A: u8 = 28;

/// How the RTP packets will be carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpTransport {
    Udp,

    /// RTSP interleaved mode: each packet is framed by a 4 byte
    /// `$ <channel> <length>` prefix that eats into the MTU
    InterleavedTcp,
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

/// The RTP packetizer
pub struct Rtp {
    mode: u32,
    transport: RtpTransport,
    out: Arc<MediaStream>,
    state: AtomicU32,
    time_base: AtomicU32,
    attach_state: Mutex<AttachState>,
}

impl Rtp {
    pub fn new(mode: u32, transport: RtpTransport) -> Arc<Rtp> {
        Arc::new(Rtp {
            mode,
            transport,
            out: MediaStream::new(),
            state: AtomicU32::new(REMUX_INACTIVE),
            time_base: AtomicU32::new(0),
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

    pub fn output(&self) -> &Arc<MediaStream> {
        &self.out
    }

    fn wants_track(&self, track: &MediaStreamTrack) -> bool {
        match track.kind() {
            TrackKind::Audio => (self.mode & mode::AUDIO) != 0,
            TrackKind::Video => (self.mode & mode::VIDEO) != 0,
        }
    }

    fn emit(&self, packet: Packet) {
        let mut event = StreamEvent::packet(Arc::new(packet));
        self.out.events().dispatch_event(event_type::PACKET, &mut event);
    }

    fn next_sequence_number(track: &MediaStreamTrack) -> u16 {
        // Wraps at 65535
        let next = track
            .sn
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sn| {
                Some((sn + 1) & 0xFFFF)
            })
            .unwrap_or(0);
        ((next + 1) & 0xFFFF) as u16
    }

    fn rtp_packet(
        &self,
        source: &Packet,
        track: &MediaStreamTrack,
        marker: u8,
        rtp_timestamp: u32,
        payload: Vec<u8>,
    ) -> Packet {
        let mut packet = source.with_payload(Bytes::from(payload));
        packet.stream_id = track.id() as u32;
        packet.side = Side::Rtp {
            v: VERSION,
            p: 0,
            x: 0,
            cc: 0,
            m: marker,
            pt: PAYLOAD_TYPE,
            sn: Rtp::next_sequence_number(track),
            timestamp: rtp_timestamp,
            ssrc: track.id() as u32,
            csrc: Vec::new(),
        };
        packet
    }

    fn on_packet(&self, packet: Arc<Packet>) {
        match packet.kind {
            PacketKind::Audio => self.on_audio_packet(packet),
            PacketKind::Video => self.on_video_packet(packet),
            PacketKind::Script => self.on_data_packet(packet),
        }
    }

    fn on_data_packet(&self, packet: Arc<Packet>) {
        if let Side::Script { key, .. } = &packet.side {
            self.out.set_data_frame(key, packet.clone());
        }
    }

    fn on_audio_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AAC" {
            error!(codec = packet.codec, "unrecognized audio codec");
            return;
        }

        let track = match self.out.audio_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        let data_type = match &packet.side {
            Side::Audio { data_type, .. } => *data_type,
            _ => return,
        };

        match data_type {
            crate::codec::aac::SPECIFIC_CONFIG => {
                // Parameter data travels out of band (SDP), nothing to emit
            }

            crate::codec::aac::RAW_FRAME_DATA => {
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

                if track.source().info_frame().is_none()
                    || self.state.load(Ordering::Acquire) != REMUX_PUMPING
                {
                    return;
                }

                self.packetize_aac(&track, &packet);
            }

            x => error!(data_type = x, "unrecognized AAC packet type"),
        }
    }

    fn on_video_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AVC" {
            error!(codec = packet.codec, "unrecognized video codec");
            return;
        }

        let track = match self.out.video_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        let (data_type, keyframe) = match &packet.side {
            Side::Video {
                data_type,
                keyframe,
                ..
            } => (*data_type, *keyframe),
            _ => return,
        };

        match data_type {
            crate::codec::avc::SEQUENCE_HEADER => {
                // SPS/PPS are re-inserted in band before each IDR slice
            }

            crate::codec::avc::NALU => {
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

                if track.source().info_frame().is_none()
                    || self.state.load(Ordering::Acquire) != REMUX_PUMPING
                    || ((self.mode & mode::KEYFRAME) == mode::KEYFRAME && !keyframe)
                {
                    return;
                }

                self.packetize_avc(&track, &packet);
            }

            crate::codec::avc::END_OF_SEQUENCE => {
                debug!("AVC sequence end");
            }

            x => error!(data_type = x, "unrecognized AVC packet type"),
        }
    }

    /// The bytes available for payload after transport framing and the RTP
    /// header are paid for
    fn effective_mtu(&self) -> usize {
        let mut size = MTU;
        if self.transport == RtpTransport::InterleavedTcp {
            // | 1 magic | 1 channel | 2 embedded data length |
            size -= 4;
        }

        size
    }

    fn packetize_avc(&self, track: &Arc<MediaStreamTrack>, packet: &Packet) {
        let nalus = match &packet.side {
            Side::Video { nalus, .. } => nalus.clone(),
            _ => return,
        };

        // rtp time / media time = clock rate / 1000
        let rtp_timestamp =
            ((packet.timestamp as u64) * H264_FREQUENCY / 1000) as u32;

        // | 12 RTP header | 1 F NRI type |
        let size = self.effective_mtu() - 13;

        let units: Vec<&Bytes> = nalus
            .iter()
            .filter(|unit| {
                let nal_type = unit[0] & 0x1F;
                // Parameter sets travel via STAP-A in front of each IDR
                nal_type != crate::codec::avc::NAL_SPS
                    && nal_type != crate::codec::avc::NAL_PPS
            })
            .collect();

        for (index, unit) in units.iter().enumerate() {
            let nal_type = unit[0] & 0x1F;
            let last_unit = index == units.len() - 1;

            if nal_type == crate::codec::avc::NAL_IDR_SLICE {
                self.emit_parameter_sets(track, packet, rtp_timestamp);
            }

            if unit.len() <= size {
                // Single NAL unit packet; the marker closes the frame
                let marker = if last_unit { 1 } else { 0 };
                let rtp =
                    self.rtp_packet(packet, track, marker, rtp_timestamp, unit.to_vec());
                self.emit(rtp);
            } else {
                self.fragment_unit(track, packet, unit, size, rtp_timestamp, last_unit);
            }
        }
    }

    /// STAP-A carrying the current SPS and PPS
    fn emit_parameter_sets(
        &self,
        track: &Arc<MediaStreamTrack>,
        packet: &Packet,
        rtp_timestamp: u32,
    ) {
        let sets = match track.source().parameter_sets() {
            Some(sets) => sets,
            None => return,
        };

        let sps_len = sets.sps.len();
        let pps_len = sets.pps.len();

        let mut payload = Vec::with_capacity(5 + sps_len + pps_len);
        payload.push((sets.sps[0] & 0x60) | NAL_STAP_A);
        payload.extend_from_slice(&(sps_len as u16).to_be_bytes());
        payload.extend_from_slice(&sets.sps);
        payload.extend_from_slice(&(pps_len as u16).to_be_bytes());
        payload.extend_from_slice(&sets.pps);

        let rtp = self.rtp_packet(packet, track, 0, rtp_timestamp, payload);
        self.emit(rtp);
    }

    /// FU-A fragmentation of one oversized NAL unit
    fn fragment_unit(
        &self,
        track: &Arc<MediaStreamTrack>,
        packet: &Packet,
        unit: &Bytes,
        mut size: usize,
        rtp_timestamp: u32,
        last_unit: bool,
    ) {
        let nal_type = unit[0] & 0x1F;
        let fu_indicator = (unit[0] & 0x60) | NAL_FU_A;

        // One more byte goes to the FU header
        size -= 1;

        // The original NAL header is dropped; the fragments carry the body
        let body_len = unit.len() - 1;
        let count = (body_len + size - 1) / size;

        let mut offset = 1_usize;
        for index in 0..count {
            let start = index == 0;
            let end = index == count - 1;

            let this_size = if end { unit.len() - offset } else { size };

            let fu_header = (if start { 0x80 } else { 0x00 })
                | (if end { 0x40 } else { 0x00 })
                | nal_type;

            let mut payload = Vec::with_capacity(2 + this_size);
            payload.push(fu_indicator);
            payload.push(fu_header);
            payload.extend_from_slice(&unit[offset..offset + this_size]);
            offset += this_size;

            let marker = if end && last_unit { 1 } else { 0 };
            let rtp = self.rtp_packet(packet, track, marker, rtp_timestamp, payload);
            self.emit(rtp);
        }
    }

    fn packetize_aac(&self, track: &Arc<MediaStreamTrack>, packet: &Packet) {
        let data = match &packet.side {
            Side::Audio { data, .. } => data.clone(),
            _ => return,
        };

        let sample_rate = track.source().information().read().sample_rate;
        if sample_rate == 0 {
            return;
        }

        // rtp time / media time = clock rate / 1000
        let rtp_timestamp =
            ((packet.timestamp as u64) * sample_rate as u64 / 1000) as u32;

        // | 12 RTP header | 4 AU header section |
        let size = self.effective_mtu() - 12 - 4;

        let n = data.len();
        let au_header = [
            0x00,
            0x10, // one AU, 16 bits of AU header
            ((n & 0x1FE0) >> 5) as u8,
            ((n & 0x1F) << 3) as u8,
        ];

        let count = (n + size - 1) / size;

        let mut offset = 0_usize;
        for index in 0..count {
            let this_size = if index == count - 1 { n - offset } else { size };

            let mut payload = Vec::with_capacity(4 + this_size);
            payload.extend_from_slice(&au_header);
            payload.extend_from_slice(&data[offset..offset + this_size]);
            offset += this_size;

            // Every fragment closes an access unit for the decoder
            let rtp = self.rtp_packet(packet, track, 1, rtp_timestamp, payload);
            self.emit(rtp);
        }
    }

    fn on_add_track(
        &self,
        track: Arc<MediaStreamTrack>,
        packet_listener: Arc<EventListener<StreamEvent>>,
    ) {
        if !self.wants_track(&track) {
            return;
        }

        if self.out.attached(track.source()).is_none() {
            self.out.add_track(track.clone_track());
            track
                .source()
                .events()
                .add_event_listener(event_type::PACKET, packet_listener);
            self.attach_state.lock().attached_sources.push(track);
        }
    }

    fn on_remove_track(
        &self,
        track: Arc<MediaStreamTrack>,
        packet_listener: &Arc<EventListener<StreamEvent>>,
    ) {
        if let Some(attached) = self.out.attached(track.source()) {
            track
                .source()
                .events()
                .remove_event_listener(event_type::PACKET, packet_listener);
            self.out.remove_track(&attached);
        }
    }
}

/// Serializes the RTP header, CSRC list, and payload into wire bytes
pub fn format(packet: &Packet) -> Option<Vec<u8>> {
    let (v, p, x, cc, m, pt, sn, timestamp, ssrc, csrc) = match &packet.side {
        Side::Rtp {
            v,
            p,
            x,
            cc,
            m,
            pt,
            sn,
            timestamp,
            ssrc,
            csrc,
        } => (*v, *p, *x, *cc, *m, *pt, *sn, *timestamp, *ssrc, csrc),
        _ => return None,
    };

    let mut bytes = Vec::with_capacity(12 + csrc.len() * 4 + packet.payload.len());
    bytes.push((v << 6) | (p << 5) | (x << 4) | cc);
    bytes.push((m << 7) | pt);
    bytes.extend_from_slice(&sn.to_be_bytes());
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    bytes.extend_from_slice(&ssrc.to_be_bytes());
    for item in csrc {
        bytes.extend_from_slice(&item.to_be_bytes());
    }
    bytes.extend_from_slice(&packet.payload);

    Some(bytes)
}

impl Remuxer for Rtp {
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
                if let (Some(rtp), StreamEventKind::Packet(packet)) =
                    (weak.upgrade(), &event.kind)
                {
                    rtp.on_packet(packet.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let add_listener = packet_listener.clone();
        let add_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(rtp), StreamEventKind::AddTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    rtp.on_add_track(track.clone(), add_listener.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let remove_listener = packet_listener.clone();
        let remove_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(rtp), StreamEventKind::RemoveTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    rtp.on_remove_track(track.clone(), &remove_listener);
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let error_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(rtp), StreamEventKind::Error { name, message }) =
                    (weak.upgrade(), &event.kind)
                {
                    debug!(%name, %message, "source stream error");
                    rtp.close();
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let close_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(rtp), StreamEventKind::Close) = (weak.upgrade(), &event.kind) {
                    rtp.close();
                }
            },
            0,
        );

        if let Some(metadata) = stream.get_data_frame("onMetaData") {
            self.out.set_data_frame("onMetaData", metadata);
        }

        for track in stream.get_tracks() {
            if !self.wants_track(&track) {
                continue;
            }

            self.out.add_track(track.clone_track());
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
