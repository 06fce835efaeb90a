//! Session abstractions.
//!
//! A session reacts to incoming RTMP messages (encoded as RTMP chunks) with
//! packets to be sent back, plus events the owning application performs its
//! own logic on (accepting connections, wiring publishers to players).

mod server;

pub use self::server::PlayStartValue;
pub use self::server::PublishMode;
pub use self::server::ServerSession;
pub use self::server::ServerSessionConfig;
pub use self::server::ServerSessionError;
pub use self::server::ServerSessionEvent;
pub use self::server::ServerSessionResult;

use lml_amf0::{Amf0Object, Amf0Value};

/// The metadata a publisher advertises about its stream via
/// `@setDataFrame(onMetaData)`
#[derive(PartialEq, Debug, Clone, Default)]
pub struct StreamMetadata {
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub video_codec: Option<String>,
    pub video_frame_rate: Option<f32>,
    pub video_bitrate_kbps: Option<u32>,
    pub audio_codec: Option<String>,
    pub audio_bitrate_kbps: Option<u32>,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub audio_is_stereo: Option<bool>,
    pub encoder: Option<String>,
}

impl StreamMetadata {
    pub fn new() -> StreamMetadata {
        StreamMetadata::default()
    }

    /// Folds the properties of an onMetaData object into the metadata
    pub fn apply_metadata_values(&mut self, properties: &Amf0Object) {
        for (key, value) in properties.iter() {
            match key {
                "width" => self.video_width = to_u32(value),
                "height" => self.video_height = to_u32(value),
                "videocodecid" => self.video_codec = to_codec_string(value),
                "videodatarate" => self.video_bitrate_kbps = to_u32(value),
                "framerate" => self.video_frame_rate = to_f32(value),
                "audiocodecid" => self.audio_codec = to_codec_string(value),
                "audiodatarate" => self.audio_bitrate_kbps = to_u32(value),
                "audiosamplerate" => self.audio_sample_rate = to_u32(value),
                "audiochannels" => self.audio_channels = to_u32(value),
                "stereo" => {
                    if let Amf0Value::Boolean(flag) = value {
                        self.audio_is_stereo = Some(*flag);
                    }
                }
                "encoder" => {
                    if let Amf0Value::Utf8String(name) = value {
                        self.encoder = Some(name.clone());
                    }
                }
                _ => (),
            }
        }
    }

    /// Renders the metadata back into an onMetaData object for relaying
    pub fn to_amf0_object(&self) -> Amf0Object {
        let mut object = Amf0Object::new();

        if let Some(value) = self.video_width {
            object.insert("width", Amf0Value::Number(value as f64));
        }
        if let Some(value) = self.video_height {
            object.insert("height", Amf0Value::Number(value as f64));
        }
        if let Some(ref value) = self.video_codec {
            object.insert("videocodecid", Amf0Value::Utf8String(value.clone()));
        }
        if let Some(value) = self.video_bitrate_kbps {
            object.insert("videodatarate", Amf0Value::Number(value as f64));
        }
        if let Some(value) = self.video_frame_rate {
            object.insert("framerate", Amf0Value::Number(value as f64));
        }
        if let Some(ref value) = self.audio_codec {
            object.insert("audiocodecid", Amf0Value::Utf8String(value.clone()));
        }
        if let Some(value) = self.audio_bitrate_kbps {
            object.insert("audiodatarate", Amf0Value::Number(value as f64));
        }
        if let Some(value) = self.audio_sample_rate {
            object.insert("audiosamplerate", Amf0Value::Number(value as f64));
        }
        if let Some(value) = self.audio_channels {
            object.insert("audiochannels", Amf0Value::Number(value as f64));
        }
        if let Some(value) = self.audio_is_stereo {
            object.insert("stereo", Amf0Value::Boolean(value));
        }
        if let Some(ref value) = self.encoder {
            object.insert("encoder", Amf0Value::Utf8String(value.clone()));
        }

        object
    }
}

fn to_u32(value: &Amf0Value) -> Option<u32> {
    match value {
        Amf0Value::Number(number) => Some(*number as u32),
        _ => None,
    }
}

fn to_f32(value: &Amf0Value) -> Option<f32> {
    match value {
        Amf0Value::Number(number) => Some(*number as f32),
        _ => None,
    }
}

fn to_codec_string(value: &Amf0Value) -> Option<String> {
    match value {
        Amf0Value::Utf8String(name) => Some(name.clone()),
        Amf0Value::Number(id) => Some(format!("{}", id)),
        _ => None,
    }
}
