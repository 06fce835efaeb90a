use super::PublishMode;
use crate::sessions::StreamMetadata;
use crate::time::RtmpTimestamp;
use bytes::Bytes;
use lml_amf0::Amf0Value;

/// Where RTMP playback should start from
#[derive(PartialEq, Debug, Clone)]
pub enum PlayStartValue {
    /// Play a live stream if one exists for the stream key, otherwise play
    /// the recorded stream with a matching name
    LiveOrRecorded,

    /// Only play live streams with the provided stream key
    LiveOnly,

    /// Play the recorded stream starting at the specified time
    StartTimeInSeconds(u32),
}

/// An event that a server session can raise
#[derive(Debug, PartialEq, Clone)]
pub enum ServerSessionEvent {
    /// The client is changing the maximum size of the RTMP chunks they send
    ClientChunkSizeChanged { new_chunk_size: u32 },

    /// The client requested a connection to an RTMP application
    ConnectionRequested {
        request_id: u32,
        app_name: String,
        instance_name: String,
    },

    /// The client requested the ability to publish on a stream key
    PublishStreamRequested {
        request_id: u32,
        app_name: String,
        instance_name: String,
        stream_key: String,
        mode: PublishMode,
        stream_id: u32,
    },

    /// The client is finished publishing on a stream key
    PublishStreamFinished {
        app_name: String,
        instance_name: String,
        stream_key: String,
    },

    /// The client changed the metadata properties of the stream it publishes
    StreamMetadataChanged {
        app_name: String,
        stream_key: String,
        metadata: StreamMetadata,
    },

    /// Audio data was received from the client
    AudioDataReceived {
        app_name: String,
        stream_key: String,
        data: Bytes,
        timestamp: RtmpTimestamp,
    },

    /// Video data was received from the client
    VideoDataReceived {
        app_name: String,
        stream_key: String,
        data: Bytes,
        timestamp: RtmpTimestamp,
    },

    /// The client sent an Amf0 command that the session does not handle.
    /// These are surfaced for logging and otherwise ignored.
    UnhandleableAmf0Command {
        command_name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_values: Vec<Amf0Value>,
    },

    /// The client requested playback of a stream key
    PlayStreamRequested {
        request_id: u32,
        app_name: String,
        instance_name: String,
        stream_key: String,
        start_at: PlayStartValue,
        duration: Option<u32>,
        reset: bool,
        stream_id: u32,
    },

    /// The client is finished playing a stream key
    PlayStreamFinished {
        app_name: String,
        instance_name: String,
        stream_key: String,
    },

    /// The client acknowledged receiving the specified number of bytes
    AcknowledgementReceived { bytes_received: u32 },

    /// The client answered one of our outgoing commands with `_result` or
    /// `_error`.  The info object (if any) rides along in the arguments.
    CommandResponseReceived {
        transaction_id: f64,
        is_error: bool,
        command_object: Amf0Value,
        additional_values: Vec<Amf0Value>,
    },

    /// The client responded to a ping request
    PingResponseReceived { timestamp: RtmpTimestamp },
}
