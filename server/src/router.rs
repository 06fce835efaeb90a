//! The Application -> Instance -> Stream routing directory.
//!
//! `get_stream` creates missing nodes on the publish path; `find_stream`
//! does not, so playing a name that nobody publishes resolves to nothing.
//! Each level is guarded by its own read-write lock: fan-out iterations
//! take read locks, add/remove take write locks.

use bytes::Bytes;
use lml_amf0::Amf0Value;
use lml_av::codec;
use lml_av::format::{MediaStream, MediaStreamTrack, TrackKind};
use lml_av::packet::{Packet, PacketKind, Side};
use lml_av::recorder::FlvRecorder;
use lml_rtmp::sessions::StreamMetadata;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("name '{0}' contains characters outside [-._0-9A-Za-z]")]
    InvalidName(String),

    #[error("stream already has a publisher")]
    AlreadyPublishing,

    #[error("publisher sent an unsupported {kind} codec (0x{codec_id:02X})")]
    UnsupportedCodec { kind: &'static str, codec_id: u8 },

    #[error("publisher sent a malformed packet: {0}")]
    MalformedPacket(#[from] codec::CodecParseError),
}

/// App and stream name components must match `[-._0-9A-Za-z]+`
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// One live stream: the media model plus its publish state
pub struct Stream {
    pub app_name: String,
    pub instance_name: String,
    pub name: String,
    media: Arc<MediaStream>,
    publishing: AtomicBool,
    metadata: Mutex<Option<StreamMetadata>>,
    recorders: Mutex<Vec<Arc<FlvRecorder>>>,
}

impl Stream {
    fn new(app_name: &str, instance_name: &str, name: &str) -> Arc<Stream> {
        Arc::new(Stream {
            app_name: app_name.to_string(),
            instance_name: instance_name.to_string(),
            name: name.to_string(),
            media: MediaStream::new(),
            publishing: AtomicBool::new(false),
            metadata: Mutex::new(None),
            recorders: Mutex::new(Vec::new()),
        })
    }

    pub fn media(&self) -> &Arc<MediaStream> {
        &self.media
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing.load(Ordering::Acquire)
    }

    /// Claims the stream for a publisher.  Fails if somebody already did.
    pub fn begin_publishing(&self) -> Result<(), RouterError> {
        if self
            .publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RouterError::AlreadyPublishing);
        }

        Ok(())
    }

    /// Releases the stream: stops recorders and closes the media model
    pub fn end_publishing(&self) {
        if self
            .publishing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        for recorder in self.recorders.lock().drain(..) {
            recorder.stop();
        }

        self.media.close();
        *self.metadata.lock() = None;
    }

    pub fn add_recorder(&self, recorder: Arc<FlvRecorder>) {
        self.recorders.lock().push(recorder);
    }

    pub fn metadata(&self) -> Option<StreamMetadata> {
        self.metadata.lock().clone()
    }

    /// Stores new publisher metadata and broadcasts the onMetaData frame so
    /// remuxers and late subscribers can replay it
    pub fn set_metadata(&self, metadata: StreamMetadata) {
        *self.metadata.lock() = Some(metadata.clone());

        let values = vec![
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::EcmaArray(metadata.to_amf0_object()),
        ];
        let payload = match lml_amf0::serialize(&values) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to serialize onMetaData");
                return;
            }
        };

        let mut packet = Packet::new(PacketKind::Script, Bytes::from(payload));
        packet.side = Side::Script {
            handler: "@setDataFrame".to_string(),
            key: "onMetaData".to_string(),
            value: Amf0Value::EcmaArray(metadata.to_amf0_object()),
        };

        let packet = Arc::new(packet);
        self.media.set_data_frame("onMetaData", packet.clone());
        self.media.broadcast(packet);
    }

    /// Sinks one audio payload from the publisher: the track and its codec
    /// source are created on first use, the packet is parsed in place, and
    /// the parsed packet fans out to every listener.
    pub fn sink_audio(&self, data: Bytes, timestamp: u32) -> Result<(), RouterError> {
        if data.len() < 2 {
            return Ok(());
        }

        let codec_id = data[0] >> 4;
        let tag = match codec_id {
            0x0A => "AAC",
            x => {
                return Err(RouterError::UnsupportedCodec {
                    kind: "audio",
                    codec_id: x,
                })
            }
        };

        let source = match self.media.audio_tracks().into_iter().next() {
            Some(track) => track.source().clone(),
            None => {
                let source = match codec::new_source(tag, self.media.info().clone()) {
                    Some(source) => source,
                    None => {
                        return Err(RouterError::UnsupportedCodec {
                            kind: "audio",
                            codec_id,
                        })
                    }
                };
                let track = MediaStreamTrack::new(TrackKind::Audio, source.clone());
                self.media.add_track(track);
                source
            }
        };

        let mut packet = Packet::new(PacketKind::Audio, data);
        packet.timestamp = timestamp;
        packet.position = 1;
        source.parse(&mut packet)?;
        source.sink(Arc::new(packet));

        Ok(())
    }

    /// Sinks one video payload from the publisher
    pub fn sink_video(&self, data: Bytes, timestamp: u32) -> Result<(), RouterError> {
        if data.len() < 2 {
            return Ok(());
        }

        let codec_id = data[0] & 0x0F;
        let tag = match codec_id {
            0x07 => "AVC",
            x => {
                return Err(RouterError::UnsupportedCodec {
                    kind: "video",
                    codec_id: x,
                })
            }
        };

        let source = match self.media.video_tracks().into_iter().next() {
            Some(track) => track.source().clone(),
            None => {
                let source = match codec::new_source(tag, self.media.info().clone()) {
                    Some(source) => source,
                    None => {
                        return Err(RouterError::UnsupportedCodec {
                            kind: "video",
                            codec_id,
                        })
                    }
                };
                let track = MediaStreamTrack::new(TrackKind::Video, source.clone());
                self.media.add_track(track);
                source
            }
        };

        let mut packet = Packet::new(PacketKind::Video, data);
        packet.timestamp = timestamp;
        source.parse(&mut packet)?;
        source.sink(Arc::new(packet));

        Ok(())
    }

    /// The audio codec parameter packet, for priming late subscribers
    pub fn audio_info_frame(&self) -> Option<Packet> {
        self.media
            .audio_tracks()
            .into_iter()
            .next()
            .and_then(|track| track.source().info_frame())
    }

    /// The video codec parameter packet, for priming late subscribers
    pub fn video_info_frame(&self) -> Option<Packet> {
        self.media
            .video_tracks()
            .into_iter()
            .next()
            .and_then(|track| track.source().info_frame())
    }
}

struct Instance {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

struct Application {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

/// The three-level stream directory
pub struct Router {
    applications: RwLock<HashMap<String, Arc<Application>>>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            applications: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a stream, creating missing directory nodes.  Used on the
    /// publish path; idempotent.
    pub fn get_stream(
        &self,
        app_name: &str,
        instance_name: &str,
        name: &str,
    ) -> Result<Arc<Stream>, RouterError> {
        for component in [app_name, name] {
            if !valid_name(component) {
                return Err(RouterError::InvalidName(component.to_string()));
            }
        }

        let application = {
            let applications = self.applications.read();
            applications.get(app_name).cloned()
        };

        let application = match application {
            Some(application) => application,
            None => {
                let mut applications = self.applications.write();
                applications
                    .entry(app_name.to_string())
                    .or_insert_with(|| {
                        Arc::new(Application {
                            instances: RwLock::new(HashMap::new()),
                        })
                    })
                    .clone()
            }
        };

        let instance = {
            let instances = application.instances.read();
            instances.get(instance_name).cloned()
        };

        let instance = match instance {
            Some(instance) => instance,
            None => {
                let mut instances = application.instances.write();
                instances
                    .entry(instance_name.to_string())
                    .or_insert_with(|| {
                        Arc::new(Instance {
                            streams: RwLock::new(HashMap::new()),
                        })
                    })
                    .clone()
            }
        };

        let existing = {
            let streams = instance.streams.read();
            streams.get(name).cloned()
        };

        match existing {
            Some(stream) => Ok(stream),
            None => {
                let mut streams = instance.streams.write();
                Ok(streams
                    .entry(name.to_string())
                    .or_insert_with(|| Stream::new(app_name, instance_name, name))
                    .clone())
            }
        }
    }

    /// Resolves a stream without creating anything.  Used on the play path.
    pub fn find_stream(
        &self,
        app_name: &str,
        instance_name: &str,
        name: &str,
    ) -> Option<Arc<Stream>> {
        let applications = self.applications.read();
        let application = applications.get(app_name)?;
        let instances = application.instances.read();
        let instance = instances.get(instance_name)?;
        let streams = instance.streams.read();
        streams.get(name).cloned()
    }

    /// Drops a stream from the directory once it is unpublished and idle
    pub fn remove_stream(&self, app_name: &str, instance_name: &str, name: &str) {
        let applications = self.applications.read();
        if let Some(application) = applications.get(app_name) {
            let instances = application.instances.read();
            if let Some(instance) = instances.get(instance_name) {
                instance.streams.write().remove(name);
            }
        }
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_stream_creates_and_is_idempotent() {
        let router = Router::new();

        let first = router.get_stream("live", "_definst_", "camera").unwrap();
        let second = router.get_stream("live", "_definst_", "camera").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn find_stream_does_not_create() {
        let router = Router::new();

        assert!(router.find_stream("live", "_definst_", "camera").is_none());

        router.get_stream("live", "_definst_", "camera").unwrap();
        assert!(router.find_stream("live", "_definst_", "camera").is_some());
    }

    #[test]
    fn instances_partition_streams() {
        let router = Router::new();

        let default = router.get_stream("live", "_definst_", "camera").unwrap();
        let studio = router.get_stream("live", "studio", "camera").unwrap();
        assert!(!Arc::ptr_eq(&default, &studio));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let router = Router::new();

        match router.get_stream("live", "_definst_", "bad/name") {
            Err(RouterError::InvalidName(name)) => assert_eq!(name, "bad/name"),
            x => panic!("Expected InvalidName, got {:?}", x.map(|_| ())),
        }

        assert!(valid_name("stream_1.low-res"));
        assert!(!valid_name(""));
        assert!(!valid_name("no spaces"));
    }

    #[test]
    fn only_one_publisher_may_claim_a_stream() {
        let router = Router::new();
        let stream = router.get_stream("live", "_definst_", "camera").unwrap();

        stream.begin_publishing().unwrap();
        match stream.begin_publishing() {
            Err(RouterError::AlreadyPublishing) => (),
            x => panic!("Expected AlreadyPublishing, got {:?}", x.map(|_| ())),
        }

        stream.end_publishing();
        stream.begin_publishing().unwrap();
    }

    #[test]
    fn sinking_audio_creates_the_track_and_parses_the_config() {
        let router = Router::new();
        let stream = router.get_stream("live", "_definst_", "camera").unwrap();

        // AAC specific config: 44100 Hz, mono
        stream
            .sink_audio(Bytes::from(vec![0xAF, 0x00, 0x12, 0x08]), 0)
            .unwrap();

        assert_eq!(stream.media().audio_tracks().len(), 1);
        assert!(stream.audio_info_frame().is_some());
        assert_eq!(stream.media().info().read().sample_rate, 44100);
    }

    #[test]
    fn unsupported_codecs_are_reported() {
        let router = Router::new();
        let stream = router.get_stream("live", "_definst_", "camera").unwrap();

        // Speex (0xB) is not in the registry
        match stream.sink_audio(Bytes::from(vec![0xB2, 0x00, 0x01]), 0) {
            Err(RouterError::UnsupportedCodec { kind: "audio", codec_id: 0x0B }) => (),
            x => panic!("Expected UnsupportedCodec, got {:?}", x),
        }
    }

    #[test]
    fn metadata_broadcast_reaches_the_dataframe_store() {
        let router = Router::new();
        let stream = router.get_stream("live", "_definst_", "camera").unwrap();

        let mut metadata = StreamMetadata::new();
        metadata.video_width = Some(1280);
        stream.set_metadata(metadata);

        let frame = stream.media().get_data_frame("onMetaData").unwrap();
        match &frame.side {
            Side::Script { key, .. } => assert_eq!(key, "onMetaData"),
            x => panic!("Expected script side data, got {:?}", x),
        }
    }
}
