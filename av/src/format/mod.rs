//! The track and stream model, plus the remuxers that repackage live media
//! into other wire and container formats.

pub mod flv;
pub mod fmp4;
pub mod rtp;

use crate::codec::TrackSource;
use crate::events::{Dispatchable, EventDispatcher};
use crate::info::{shared_information, SharedInformation};
use crate::packet::Packet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Event type strings used across the stream model
pub mod event_type {
    pub const PACKET: &str = "packet";
    pub const ADD_TRACK: &str = "addtrack";
    pub const REMOVE_TRACK: &str = "removetrack";
    pub const ERROR: &str = "error";
    pub const CLOSE: &str = "close";
}

/// Remuxer output gating, combined with bitwise OR
pub mod mode {
    pub const NONE: u32 = 0x00;
    pub const AUDIO: u32 = 0x01;
    pub const VIDEO: u32 = 0x02;
    pub const ALL: u32 = AUDIO | VIDEO;
    pub const KEYFRAME: u32 = 0x04 | VIDEO;
    pub const INTERLEAVED: u32 = 0x08;
    pub const ADVANCED: u32 = 0x10;
    pub const MANUAL: u32 = 0x4000_0000;
    pub const OFF: u32 = 0x8000_0000;

    /// Parses a separator-delimited mode list such as `"audio|keyframe"`
    pub fn parse(value: &str, separator: &str) -> u32 {
        let mut flags = NONE;
        for part in value.split(separator) {
            flags |= match part {
                "audio" => AUDIO,
                "video" => VIDEO,
                "all" => ALL,
                "keyframe" => KEYFRAME,
                "interleaved" => INTERLEAVED,
                "advanced" => ADVANCED,
                "manual" => MANUAL,
                "off" => OFF,
                _ => NONE,
            };
        }

        flags
    }
}

/// Remuxer ready states
pub const REMUX_INACTIVE: u32 = 0x00;
pub const REMUX_WAITING: u32 = 0x01;
pub const REMUX_PUMPING: u32 = 0x02;

/// The event payload carried through stream, source, and remuxer
/// dispatchers
pub struct StreamEvent {
    pub kind: StreamEventKind,
    stopped: bool,
}

pub enum StreamEventKind {
    Packet(Arc<Packet>),
    AddTrack(Arc<MediaStreamTrack>),
    RemoveTrack(Arc<MediaStreamTrack>),
    Error { name: String, message: String },
    Close,
}

impl StreamEvent {
    pub fn packet(packet: Arc<Packet>) -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::Packet(packet),
            stopped: false,
        }
    }

    pub fn add_track(track: Arc<MediaStreamTrack>) -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::AddTrack(track),
            stopped: false,
        }
    }

    pub fn remove_track(track: Arc<MediaStreamTrack>) -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::RemoveTrack(track),
            stopped: false,
        }
    }

    pub fn error(name: &str, message: String) -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::Error {
                name: name.to_string(),
                message,
            },
            stopped: false,
        }
    }

    pub fn close() -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::Close,
            stopped: false,
        }
    }
}

impl Dispatchable for StreamEvent {
    fn stop_propagation(&mut self) {
        self.stopped = true;
    }

    fn propagation_stopped(&self) -> bool {
        self.stopped
    }
}

/// Track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// A single media track within a stream.
///
/// Track ids are assigned by the stream the track is added to; they start
/// at 1 and are never reused (ISO/IEC 14496-12 8.3.2.3).  `sn` doubles as
/// the fMP4 fragment counter and the RTP sequence seed, and `timestamp`
/// accumulates the decode time written to tfdt boxes.
pub struct MediaStreamTrack {
    id: AtomicI32,
    kind: TrackKind,
    source: Arc<dyn TrackSource>,
    pub sn: AtomicU32,
    pub timestamp: AtomicU32,
}

impl MediaStreamTrack {
    pub fn new(kind: TrackKind, source: Arc<dyn TrackSource>) -> Arc<MediaStreamTrack> {
        Arc::new(MediaStreamTrack {
            id: AtomicI32::new(0),
            kind,
            source,
            sn: AtomicU32::new(0),
            timestamp: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> &Arc<dyn TrackSource> {
        &self.source
    }

    /// Clones the track identity-free: same kind and source, no id yet
    pub fn clone_track(&self) -> Arc<MediaStreamTrack> {
        MediaStreamTrack::new(self.kind, self.source.clone())
    }
}

struct StreamInner {
    index: i32,
    tracks: Vec<Arc<MediaStreamTrack>>,
    dataframes: HashMap<String, Arc<Packet>>,
}

/// A directory of tracks plus the stream's dataframe store.
///
/// Exactly one publisher feeds a stream; any number of subscribers (players,
/// remuxers, recorders) listen on it.  Dataframes survive so late
/// subscribers can be primed with the last onMetaData.
pub struct MediaStream {
    events: EventDispatcher<StreamEvent>,
    info: SharedInformation,
    inner: RwLock<StreamInner>,
}

impl MediaStream {
    pub fn new() -> Arc<MediaStream> {
        Arc::new(MediaStream {
            events: EventDispatcher::new(),
            info: shared_information(),
            inner: RwLock::new(StreamInner {
                index: 1,
                tracks: Vec::new(),
                dataframes: HashMap::new(),
            }),
        })
    }

    pub fn events(&self) -> &EventDispatcher<StreamEvent> {
        &self.events
    }

    pub fn info(&self) -> &SharedInformation {
        &self.info
    }

    /// Adds a track, assigning the next never-reused id (>= 1)
    pub fn add_track(&self, track: Arc<MediaStreamTrack>) {
        {
            let mut inner = self.inner.write();
            if inner.tracks.iter().any(|existing| Arc::ptr_eq(existing, &track)) {
                warn!("track already added");
                return;
            }

            track.set_id(inner.index);
            inner.index += 1;
            inner.tracks.push(track.clone());
        }

        let mut event = StreamEvent::add_track(track);
        self.events.dispatch_event(event_type::ADD_TRACK, &mut event);
    }

    pub fn remove_track(&self, track: &Arc<MediaStreamTrack>) {
        let removed = {
            let mut inner = self.inner.write();
            let before = inner.tracks.len();
            inner.tracks.retain(|existing| !Arc::ptr_eq(existing, track));
            inner.tracks.len() != before
        };

        if removed {
            let mut event = StreamEvent::remove_track(track.clone());
            self.events.dispatch_event(event_type::REMOVE_TRACK, &mut event);
        }
    }

    pub fn get_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.inner.read().tracks.clone()
    }

    pub fn get_track_by_id(&self, id: i32) -> Option<Arc<MediaStreamTrack>> {
        self.inner
            .read()
            .tracks
            .iter()
            .find(|track| track.id() == id)
            .cloned()
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks_of_kind(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks_of_kind(TrackKind::Video)
    }

    fn tracks_of_kind(&self, kind: TrackKind) -> Vec<Arc<MediaStreamTrack>> {
        self.inner
            .read()
            .tracks
            .iter()
            .filter(|track| track.kind() == kind)
            .cloned()
            .collect()
    }

    /// Returns the track attached to the given source, if any
    pub fn attached(&self, source: &Arc<dyn TrackSource>) -> Option<Arc<MediaStreamTrack>> {
        self.inner
            .read()
            .tracks
            .iter()
            .find(|track| Arc::ptr_eq(track.source(), source))
            .cloned()
    }

    /// Stores a data frame; at most one entry exists per key
    pub fn set_data_frame(&self, key: &str, packet: Arc<Packet>) {
        self.inner.write().dataframes.insert(key.to_string(), packet);
    }

    pub fn get_data_frame(&self, key: &str) -> Option<Arc<Packet>> {
        self.inner.read().dataframes.get(key).cloned()
    }

    pub fn clear_data_frame(&self, key: &str) {
        self.inner.write().dataframes.remove(key);
    }

    /// Broadcasts a parsed packet to the stream's own listeners
    pub fn broadcast(&self, packet: Arc<Packet>) {
        let mut event = StreamEvent::packet(packet);
        self.events.dispatch_event(event_type::PACKET, &mut event);
    }

    /// Stops every track and notifies listeners that the stream is done.
    /// Track ids are never reused, so the index keeps counting up.
    pub fn close(&self) {
        let tracks = {
            let mut inner = self.inner.write();
            std::mem::take(&mut inner.tracks)
        };

        for track in tracks {
            let mut event = StreamEvent::remove_track(track);
            self.events.dispatch_event(event_type::REMOVE_TRACK, &mut event);
        }

        let mut event = StreamEvent::close();
        self.events.dispatch_event(event_type::CLOSE, &mut event);
    }
}

/// A remuxer repackages the media of an attached stream into another
/// format and fans the result out to its own packet listeners.
pub trait Remuxer: Send + Sync {
    fn mode(&self) -> u32;
    fn events(&self) -> &EventDispatcher<StreamEvent>;
    fn attach(self: Arc<Self>, stream: &Arc<MediaStream>);
    fn close(&self);
}

/// The remuxer registry: format name to factory
pub fn new_remuxer(name: &str, mode: u32) -> Option<Arc<dyn Remuxer>> {
    match name {
        "FLV" => Some(flv::Flv::new(mode) as Arc<dyn Remuxer>),
        "FMP4" => Some(fmp4::Fmp4::new(mode, false) as Arc<dyn Remuxer>),
        "CMAF" => Some(fmp4::Fmp4::new(mode, true) as Arc<dyn Remuxer>),
        "RTP" => Some(rtp::Rtp::new(mode, rtp::RtpTransport::Udp) as Arc<dyn Remuxer>),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn audio_track() -> Arc<MediaStreamTrack> {
        let source = codec::new_source("AAC", shared_information()).unwrap();
        MediaStreamTrack::new(TrackKind::Audio, source)
    }

    fn video_track() -> Arc<MediaStreamTrack> {
        let source = codec::new_source("AVC", shared_information()).unwrap();
        MediaStreamTrack::new(TrackKind::Video, source)
    }

    #[test]
    fn track_ids_start_at_one_and_are_never_reused() {
        let stream = MediaStream::new();

        let audio = audio_track();
        let video = video_track();
        stream.add_track(audio.clone());
        stream.add_track(video.clone());

        assert_eq!(audio.id(), 1);
        assert_eq!(video.id(), 2);

        stream.remove_track(&audio);

        let replacement = audio_track();
        stream.add_track(replacement.clone());
        assert_eq!(replacement.id(), 3, "removed ids must not be reused");
    }

    #[test]
    fn tracks_are_found_by_kind_and_id() {
        let stream = MediaStream::new();
        let audio = audio_track();
        let video = video_track();
        stream.add_track(audio.clone());
        stream.add_track(video.clone());

        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 1);
        assert!(Arc::ptr_eq(&stream.get_track_by_id(2).unwrap(), &video));
        assert!(stream.get_track_by_id(9).is_none());
    }

    #[test]
    fn attached_finds_the_track_for_a_source() {
        let stream = MediaStream::new();
        let audio = audio_track();
        stream.add_track(audio.clone());

        assert!(stream.attached(audio.source()).is_some());

        let other = video_track();
        assert!(stream.attached(other.source()).is_none());
    }

    #[test]
    fn dataframes_hold_one_entry_per_key() {
        use crate::packet::{Packet, PacketKind};
        use bytes::Bytes;

        let stream = MediaStream::new();
        let first = Arc::new(Packet::new(PacketKind::Script, Bytes::from(vec![1_u8])));
        let second = Arc::new(Packet::new(PacketKind::Script, Bytes::from(vec![2_u8])));

        stream.set_data_frame("onMetaData", first);
        stream.set_data_frame("onMetaData", second.clone());

        let stored = stream.get_data_frame("onMetaData").unwrap();
        assert!(Arc::ptr_eq(&stored, &second));

        stream.clear_data_frame("onMetaData");
        assert!(stream.get_data_frame("onMetaData").is_none());
    }

    #[test]
    fn mode_strings_parse_into_flag_sets() {
        assert_eq!(mode::parse("audio", "|"), mode::AUDIO);
        assert_eq!(mode::parse("all", "|"), mode::AUDIO | mode::VIDEO);
        assert_eq!(
            mode::parse("keyframe|interleaved", "|"),
            mode::KEYFRAME | mode::INTERLEAVED
        );
        assert_ne!(mode::parse("keyframe", "|") & mode::VIDEO, 0, "keyframe implies video");
        assert_eq!(mode::parse("off", "|"), mode::OFF);
        assert_eq!(mode::parse("bogus", "|"), mode::NONE);
    }

    #[test]
    fn subscribers_see_packets_in_publish_order() {
        use crate::events::EventListener;
        use crate::packet::{Packet, PacketKind};
        use bytes::Bytes;
        use parking_lot::Mutex;

        let stream = MediaStream::new();

        let seen_a: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        for seen in [&seen_a, &seen_b] {
            let seen = seen.clone();
            stream.events().add_event_listener(
                event_type::PACKET,
                EventListener::new(
                    move |event: &mut StreamEvent| {
                        if let StreamEventKind::Packet(packet) = &event.kind {
                            seen.lock().push(packet.payload[0]);
                        }
                    },
                    0,
                ),
            );
        }

        for value in 0..5_u8 {
            let packet = Packet::new(PacketKind::Audio, Bytes::from(vec![value]));
            stream.broadcast(Arc::new(packet));
        }

        assert_eq!(*seen_a.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*seen_a.lock(), *seen_b.lock());
    }
}
