mod active_stream;
mod config;
mod errors;
mod events;
mod outstanding_requests;
mod publish_mode;
mod result;
mod session_state;


use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use lml_amf0::{Amf0Object, Amf0Value};
use tracing::warn;

use self::active_stream::{ActiveStream, StreamState};
use self::outstanding_requests::OutstandingRequest;
use self::session_state::SessionState;
use crate::chunk_io::{ChunkDeserializer, ChunkSerializer, Packet};
use crate::messages::{
    MessagePayload, PeerBandwidthLimitType, RtmpMessage, UserControlEventType,
};
use crate::sessions::StreamMetadata;
use crate::time::RtmpTimestamp;

pub use self::config::ServerSessionConfig;
pub use self::errors::ServerSessionError;
pub use self::events::{PlayStartValue, ServerSessionEvent};
pub use self::publish_mode::PublishMode;
pub use self::result::ServerSessionResult;

mod status {
    pub const LEVEL_STATUS: &str = "status";
    pub const LEVEL_ERROR: &str = "error";

    pub const CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
    pub const CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";
    pub const PUBLISH_START: &str = "NetStream.Publish.Start";
    pub const PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
    pub const UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
    pub const PLAY_START: &str = "NetStream.Play.Start";
    pub const PLAY_RESET: &str = "NetStream.Play.Reset";
    pub const PLAY_FAILED: &str = "NetStream.Play.Failed";
    pub const SEEK_FAILED: &str = "NetStream.Seek.Failed";
    pub const STREAM_FAILED: &str = "NetStream.Failed";
}

/// A session representing the server side of a single RTMP connection.
///
/// The `ServerSession` parses RTMP chunks coming in from a client into RTMP
/// messages and performs the common server side workflows against them.  It
/// either provides pre-serialized packets to be sent back to the client or
/// events the parent application can perform custom logic against (like
/// deciding whether a connection request should be accepted).
///
/// Due to the header compression of the RTMP chunk protocol, every byte
/// received **after** the handshake must be passed into the session, all
/// response packets must be sent to the client **in order**, and no other
/// bytes may be interleaved into the outbound stream.
pub struct ServerSession {
    start_time: SystemTime,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
    config: ServerSessionConfig,
    bytes_received: u64,
    bytes_received_since_last_ack: u32,
    peer_window_ack_size: Option<u32>,
    connected_app_name: Option<String>,
    instance_name: String,
    outstanding_requests: HashMap<u32, OutstandingRequest>,
    next_request_number: u32,
    current_state: SessionState,
    object_encoding: f64,
    active_streams: HashMap<u32, ActiveStream>,
    next_stream_id: u32,
}

impl ServerSession {
    pub fn new(config: ServerSessionConfig) -> ServerSession {
        ServerSession {
            start_time: SystemTime::now(),
            serializer: ChunkSerializer::new(),
            deserializer: ChunkDeserializer::new(),
            config,
            bytes_received: 0,
            bytes_received_since_last_ack: 0,
            peer_window_ack_size: None,
            connected_app_name: None,
            instance_name: "_definst_".to_string(),
            outstanding_requests: HashMap::new(),
            next_request_number: 0,
            current_state: SessionState::Started,
            object_encoding: 0.0,
            active_streams: HashMap::new(),
            next_stream_id: 1,
        }
    }

    /// Takes in bytes that encode RTMP chunks and returns any responses or
    /// events that can be reacted to.
    pub fn handle_input(
        &mut self,
        bytes: &[u8],
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let mut results = Vec::new();

        self.track_inbound_bytes(bytes.len(), &mut results)?;

        let mut bytes_to_process = bytes;
        loop {
            match self.deserializer.get_next_message(bytes_to_process)? {
                None => break,
                Some(payload) => {
                    let message = payload.to_rtmp_message()?;

                    let mut message_results = match message {
                        RtmpMessage::Abort { stream_id } => self.handle_abort(stream_id)?,

                        RtmpMessage::Acknowledgement { sequence_number } => {
                            self.handle_acknowledgement(sequence_number)?
                        }

                        RtmpMessage::Amf0Command {
                            command_name,
                            transaction_id,
                            command_object,
                            additional_arguments,
                        } => self.handle_amf0_command(
                            payload.message_stream_id,
                            command_name,
                            transaction_id,
                            command_object,
                            additional_arguments,
                        )?,

                        RtmpMessage::Amf0Data { values } => {
                            self.handle_amf0_data(values, payload.message_stream_id)?
                        }

                        RtmpMessage::AudioData { data } => self.handle_audio_data(
                            data,
                            payload.message_stream_id,
                            payload.timestamp,
                        )?,

                        RtmpMessage::SetChunkSize { size } => self.handle_set_chunk_size(size)?,

                        RtmpMessage::SetPeerBandwidth { .. } => Vec::new(),

                        RtmpMessage::UserControl {
                            event_type,
                            stream_id,
                            buffer_length,
                            timestamp,
                        } => self.handle_user_control(
                            event_type,
                            stream_id,
                            buffer_length,
                            timestamp,
                        )?,

                        RtmpMessage::VideoData { data } => self.handle_video_data(
                            data,
                            payload.message_stream_id,
                            payload.timestamp,
                        )?,

                        RtmpMessage::WindowAcknowledgement { size } => {
                            self.peer_window_ack_size = Some(size);
                            Vec::new()
                        }

                        _ => vec![ServerSessionResult::UnhandleableMessageReceived(payload)],
                    };

                    results.append(&mut message_results);
                    bytes_to_process = &[];
                }
            }
        }

        Ok(results)
    }

    /// Accepts an outstanding request (connection, publish, or play),
    /// producing the packets that confirm it to the client
    pub fn accept_request(
        &mut self,
        request_id: u32,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let request = match self.outstanding_requests.remove(&request_id) {
            Some(request) => request,
            None => return Err(ServerSessionError::InvalidRequestId(request_id)),
        };

        match request {
            OutstandingRequest::ConnectionRequest {
                app_name,
                instance_name,
                transaction_id,
            } => self.accept_connection_request(app_name, instance_name, transaction_id),

            OutstandingRequest::PublishRequested {
                stream_key,
                mode,
                stream_id,
            } => self.accept_publish_request(stream_id, stream_key, mode),

            OutstandingRequest::PlayRequested {
                stream_key,
                stream_id,
                reset,
            } => self.accept_play_request(stream_id, stream_key, reset),
        }
    }

    /// Rejects an outstanding request with a descriptive status.  The caller
    /// decides whether the connection should also be torn down.
    pub fn reject_request(
        &mut self,
        request_id: u32,
        description: &str,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let request = match self.outstanding_requests.remove(&request_id) {
            Some(request) => request,
            None => return Err(ServerSessionError::InvalidRequestId(request_id)),
        };

        let packet = match request {
            OutstandingRequest::ConnectionRequest { transaction_id, .. } => self.create_command(
                "_error".to_string(),
                transaction_id,
                Amf0Value::Null,
                vec![Amf0Value::Object(status_object(
                    status::LEVEL_ERROR,
                    status::CONNECT_REJECTED,
                    description,
                ))],
                0,
            )?,

            OutstandingRequest::PublishRequested { stream_id, .. } => self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PUBLISH_BAD_NAME,
                description,
            )?,

            OutstandingRequest::PlayRequested { stream_id, .. } => self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PLAY_FAILED,
                description,
            )?,
        };

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    /// Forms the packet relaying an onMetaData frame to a playing client
    pub fn send_metadata(
        &mut self,
        stream_id: u32,
        metadata: &StreamMetadata,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("onMetaData".to_string()),
                Amf0Value::EcmaArray(metadata.to_amf0_object()),
            ],
        };

        self.serialize_message(message, RtmpTimestamp::new(0), stream_id, false)
    }

    /// Forms the packet relaying an audio payload to a playing client
    pub fn send_audio_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        timestamp: RtmpTimestamp,
        can_be_dropped: bool,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::AudioData { data };
        self.serialize_message(message, timestamp, stream_id, can_be_dropped)
    }

    /// Forms the packet relaying a video payload to a playing client
    pub fn send_video_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        timestamp: RtmpTimestamp,
        can_be_dropped: bool,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::VideoData { data };
        self.serialize_message(message, timestamp, stream_id, can_be_dropped)
    }

    /// The acknowledgement window the peer advertised, once it has
    pub fn peer_window_ack_size(&self) -> Option<u32> {
        self.peer_window_ack_size
    }

    /// Forms an onStatus packet with the given info object fields
    pub fn send_status(
        &mut self,
        stream_id: u32,
        level: &str,
        code: &str,
        description: &str,
    ) -> Result<Packet, ServerSessionError> {
        self.create_status(stream_id, level, code, description)
    }

    fn track_inbound_bytes(
        &mut self,
        byte_count: usize,
        results: &mut Vec<ServerSessionResult>,
    ) -> Result<(), ServerSessionError> {
        self.bytes_received += byte_count as u64;
        self.bytes_received_since_last_ack =
            self.bytes_received_since_last_ack.wrapping_add(byte_count as u32);

        if self.bytes_received_since_last_ack >= self.config.window_ack_size {
            let message = RtmpMessage::Acknowledgement {
                sequence_number: self.bytes_received as u32,
            };

            let packet = self.serialize_message(message, self.current_epoch(), 0, false)?;
            results.push(ServerSessionResult::OutboundResponse(packet));
            self.bytes_received_since_last_ack = 0;
        }

        Ok(())
    }

    fn handle_abort(&self, _stream_id: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        Ok(Vec::new())
    }

    fn handle_acknowledgement(
        &self,
        sequence_number: u32,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::AcknowledgementReceived {
                bytes_received: sequence_number,
            },
        )])
    }

    fn handle_set_chunk_size(
        &mut self,
        size: u32,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        self.deserializer.set_max_chunk_size(size as usize)?;
        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::ClientChunkSizeChanged {
                new_chunk_size: size,
            },
        )])
    }

    fn handle_user_control(
        &mut self,
        event_type: UserControlEventType,
        _stream_id: Option<u32>,
        _buffer_length: Option<u32>,
        timestamp: Option<RtmpTimestamp>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match event_type {
            UserControlEventType::PingRequest => {
                let message = RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingResponse,
                    stream_id: None,
                    buffer_length: None,
                    timestamp,
                };

                let packet = self.serialize_message(message, self.current_epoch(), 0, false)?;
                Ok(vec![ServerSessionResult::OutboundResponse(packet)])
            }

            UserControlEventType::PingResponse => Ok(vec![ServerSessionResult::RaisedEvent(
                ServerSessionEvent::PingResponseReceived {
                    timestamp: timestamp.unwrap_or(RtmpTimestamp::new(0)),
                },
            )]),

            _ => Ok(Vec::new()),
        }
    }

    fn handle_amf0_command(
        &mut self,
        stream_id: u32,
        name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_args: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let results = match name.as_str() {
            "connect" => self.handle_command_connect(transaction_id, command_object)?,
            "createStream" => self.handle_command_create_stream(transaction_id)?,
            "publish" => self.handle_command_publish(stream_id, transaction_id, additional_args)?,
            "play" => self.handle_command_play(stream_id, transaction_id, additional_args)?,
            "pause" => self.handle_command_pause(stream_id, transaction_id)?,
            "seek" => self.handle_command_seek(stream_id, transaction_id)?,
            "deleteStream" => self.handle_command_delete_stream(additional_args)?,
            "closeStream" => self.close_stream(stream_id)?,
            "_result" | "_error" => self.handle_command_response(
                name == "_error",
                transaction_id,
                command_object,
                additional_args,
            )?,

            _ => {
                // Unknown commands must not kill the connection
                warn!(command = %name, "Ignoring unsupported command");
                vec![ServerSessionResult::RaisedEvent(
                    ServerSessionEvent::UnhandleableAmf0Command {
                        command_name: name,
                        additional_values: additional_args,
                        transaction_id,
                        command_object,
                    },
                )]
            }
        };

        Ok(results)
    }

    fn handle_command_connect(
        &mut self,
        transaction_id: f64,
        command_object: Amf0Value,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let mut properties = match command_object {
            Amf0Value::Object(properties) => properties,
            _ => return Err(ServerSessionError::NoAppNameForConnectionRequest),
        };

        let app_path = match properties.remove("app") {
            Some(Amf0Value::Utf8String(app)) if !app.is_empty() => app,
            _ => return Err(ServerSessionError::NoAppNameForConnectionRequest),
        };

        self.object_encoding = match properties.get("objectEncoding") {
            Some(Amf0Value::Number(number)) => *number,
            _ => 0.0,
        };

        // The app property may carry the instance after a slash
        let trimmed = app_path.trim_end_matches('/');
        let (app_name, instance_name) = match trimmed.split_once('/') {
            Some((app, instance)) if !instance.is_empty() => {
                (app.to_string(), instance.to_string())
            }
            _ => (trimmed.to_string(), "_definst_".to_string()),
        };

        self.instance_name = instance_name.clone();

        let request = OutstandingRequest::ConnectionRequest {
            app_name: app_name.clone(),
            instance_name: instance_name.clone(),
            transaction_id,
        };

        let request_number = self.next_request_number;
        self.next_request_number += 1;
        self.outstanding_requests.insert(request_number, request);

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::ConnectionRequested {
                request_id: request_number,
                app_name,
                instance_name,
            },
        )])
    }

    fn accept_connection_request(
        &mut self,
        app_name: String,
        instance_name: String,
        transaction_id: f64,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        self.connected_app_name = Some(app_name);
        self.instance_name = instance_name;
        self.current_state = SessionState::Connected;

        let mut results = Vec::with_capacity(5);
        let epoch = self.current_epoch();

        // Post-handshake control burst, in the order clients expect it
        let window_ack = RtmpMessage::WindowAcknowledgement {
            size: self.config.window_ack_size,
        };
        let packet = self.serialize_message(window_ack, epoch, 0, false)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        let bandwidth = RtmpMessage::SetPeerBandwidth {
            size: self.config.peer_bandwidth,
            limit_type: PeerBandwidthLimitType::Dynamic,
        };
        let packet = self.serialize_message(bandwidth, epoch, 0, false)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        let stream_begin = RtmpMessage::UserControl {
            event_type: UserControlEventType::StreamBegin,
            stream_id: Some(0),
            buffer_length: None,
            timestamp: None,
        };
        let packet = self.serialize_message(stream_begin, epoch, 0, false)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        let packet = self.serializer.set_max_chunk_size(self.config.chunk_size, epoch)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        let mut fms_properties = Amf0Object::new();
        fms_properties.insert(
            "fmsVer",
            Amf0Value::Utf8String(self.config.fms_version.clone()),
        );
        fms_properties.insert("capabilities", Amf0Value::Number(255.0));
        fms_properties.insert("mode", Amf0Value::Number(1.0));

        let mut info = status_object(
            status::LEVEL_STATUS,
            status::CONNECT_SUCCESS,
            "Connection succeeded.",
        );
        info.insert("objectEncoding", Amf0Value::Number(self.object_encoding));

        let mut version = Amf0Object::new();
        version.insert(
            "version",
            Amf0Value::Utf8String(fms_version_number(&self.config.fms_version)),
        );
        info.insert("data", Amf0Value::EcmaArray(version));

        let packet = self.create_command(
            "_result".to_string(),
            transaction_id,
            Amf0Value::Object(fms_properties),
            vec![Amf0Value::Object(info)],
            0,
        )?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        Ok(results)
    }

    fn handle_command_create_stream(
        &mut self,
        transaction_id: f64,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let new_stream_id = self.next_stream_id;
        self.next_stream_id += 1;

        self.active_streams.insert(
            new_stream_id,
            ActiveStream {
                current_state: StreamState::Created,
            },
        );

        let packet = self.create_command(
            "_result".to_string(),
            transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Number(new_stream_id as f64)],
            0,
        )?;

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    fn handle_command_publish(
        &mut self,
        stream_id: u32,
        _transaction_id: f64,
        mut arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if self.current_state != SessionState::Connected || self.connected_app_name.is_none() {
            let packet = self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PUBLISH_BAD_NAME,
                "Can't publish before connecting",
            )?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        if !self.active_streams.contains_key(&stream_id) {
            return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                action: "publish".to_string(),
                stream_id,
            });
        }

        if arguments.len() < 2 {
            let packet = self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PUBLISH_BAD_NAME,
                "Invalid publish arguments",
            )?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        let stream_key = match arguments.remove(0) {
            Amf0Value::Utf8String(key) => key,
            _ => {
                let packet = self.create_status(
                    stream_id,
                    status::LEVEL_ERROR,
                    status::PUBLISH_BAD_NAME,
                    "Invalid publish arguments",
                )?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        let mode = match arguments.remove(0) {
            Amf0Value::Utf8String(raw_mode) => match raw_mode.as_str() {
                "live" => PublishMode::Live,
                "record" => PublishMode::Record,
                "append" => PublishMode::Append,
                _ => {
                    let packet = self.create_status(
                        stream_id,
                        status::LEVEL_ERROR,
                        status::PUBLISH_BAD_NAME,
                        "Invalid publish mode given",
                    )?;
                    return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
                }
            },

            _ => {
                let packet = self.create_status(
                    stream_id,
                    status::LEVEL_ERROR,
                    status::PUBLISH_BAD_NAME,
                    "Invalid publish arguments",
                )?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        let request = OutstandingRequest::PublishRequested {
            stream_key: stream_key.clone(),
            mode: mode.clone(),
            stream_id,
        };

        let request_number = self.next_request_number;
        self.next_request_number += 1;
        self.outstanding_requests.insert(request_number, request);

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::PublishStreamRequested {
                request_id: request_number,
                app_name: self.connected_app_name.clone().unwrap(),
                instance_name: self.instance_name.clone(),
                stream_key,
                mode,
                stream_id,
            },
        )])
    }

    fn accept_publish_request(
        &mut self,
        stream_id: u32,
        stream_key: String,
        mode: PublishMode,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match self.active_streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.current_state = StreamState::Publishing {
                    stream_key: stream_key.clone(),
                    mode,
                };
            }
            None => {
                return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                    action: "publish".to_string(),
                    stream_id,
                })
            }
        }

        let mut results = Vec::with_capacity(2);

        let stream_begin = RtmpMessage::UserControl {
            event_type: UserControlEventType::StreamBegin,
            stream_id: Some(stream_id),
            buffer_length: None,
            timestamp: None,
        };
        let packet = self.serialize_message(stream_begin, self.current_epoch(), 0, false)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        let description = format!("Successfully started publishing on stream key {}", stream_key);
        let packet = self.create_status(
            stream_id,
            status::LEVEL_STATUS,
            status::PUBLISH_START,
            &description,
        )?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        Ok(results)
    }

    fn handle_command_play(
        &mut self,
        stream_id: u32,
        _transaction_id: f64,
        mut arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if self.current_state != SessionState::Connected || self.connected_app_name.is_none() {
            let packet = self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PLAY_FAILED,
                "Can't play before connecting",
            )?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        if !self.active_streams.contains_key(&stream_id) {
            return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                action: "play".to_string(),
                stream_id,
            });
        }

        if arguments.is_empty() {
            let packet = self.create_status(
                stream_id,
                status::LEVEL_ERROR,
                status::PLAY_FAILED,
                "Invalid play arguments",
            )?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        let stream_key = match arguments.remove(0) {
            Amf0Value::Utf8String(key) => key,
            _ => {
                let packet = self.create_status(
                    stream_id,
                    status::LEVEL_ERROR,
                    status::PLAY_FAILED,
                    "Invalid play arguments",
                )?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        // Optional arguments with the documented defaults
        let start = if matches!(arguments.first(), Some(Amf0Value::Number(_))) {
            match arguments.remove(0) {
                Amf0Value::Number(start) => start,
                _ => -2.0,
            }
        } else {
            -2.0
        };

        let duration = if matches!(arguments.first(), Some(Amf0Value::Number(_))) {
            match arguments.remove(0) {
                Amf0Value::Number(duration) => duration,
                _ => -1.0,
            }
        } else {
            -1.0
        };

        let reset = match arguments.first() {
            Some(Amf0Value::Boolean(reset)) => *reset,
            _ => true,
        };

        let start_at = if start == -2.0 {
            PlayStartValue::LiveOrRecorded
        } else if start == -1.0 {
            PlayStartValue::LiveOnly
        } else {
            PlayStartValue::StartTimeInSeconds(start.max(0.0) as u32)
        };

        let duration = if duration < 0.0 {
            None
        } else {
            Some(duration as u32)
        };

        let request = OutstandingRequest::PlayRequested {
            stream_key: stream_key.clone(),
            stream_id,
            reset,
        };

        let request_number = self.next_request_number;
        self.next_request_number += 1;
        self.outstanding_requests.insert(request_number, request);

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::PlayStreamRequested {
                request_id: request_number,
                app_name: self.connected_app_name.clone().unwrap(),
                instance_name: self.instance_name.clone(),
                stream_key,
                start_at,
                duration,
                reset,
                stream_id,
            },
        )])
    }

    fn accept_play_request(
        &mut self,
        stream_id: u32,
        stream_key: String,
        reset: bool,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match self.active_streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.current_state = StreamState::Playing {
                    stream_key: stream_key.clone(),
                };
            }
            None => {
                return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                    action: "play".to_string(),
                    stream_id,
                })
            }
        }

        let mut results = Vec::with_capacity(3);

        let stream_begin = RtmpMessage::UserControl {
            event_type: UserControlEventType::StreamBegin,
            stream_id: Some(stream_id),
            buffer_length: None,
            timestamp: None,
        };
        let packet = self.serialize_message(stream_begin, self.current_epoch(), 0, false)?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        if reset {
            let description = format!("Reset for stream key {}", stream_key);
            let packet = self.create_status(
                stream_id,
                status::LEVEL_STATUS,
                status::PLAY_RESET,
                &description,
            )?;
            results.push(ServerSessionResult::OutboundResponse(packet));
        }

        let description = format!("Playback started for stream key {}", stream_key);
        let packet = self.create_status(
            stream_id,
            status::LEVEL_STATUS,
            status::PLAY_START,
            &description,
        )?;
        results.push(ServerSessionResult::OutboundResponse(packet));

        Ok(results)
    }

    fn handle_command_pause(
        &mut self,
        stream_id: u32,
        transaction_id: f64,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        // Live streams cannot pause; the command is understood but refused
        let packet = self.create_command(
            "_error".to_string(),
            transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Object(status_object(
                status::LEVEL_ERROR,
                status::STREAM_FAILED,
                "Pause is not available on live streams",
            ))],
            stream_id,
        )?;

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    fn handle_command_seek(
        &mut self,
        stream_id: u32,
        transaction_id: f64,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let packet = self.create_command(
            "_error".to_string(),
            transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Object(status_object(
                status::LEVEL_ERROR,
                status::SEEK_FAILED,
                "Seek is not available on live streams",
            ))],
            stream_id,
        )?;

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    fn handle_command_delete_stream(
        &mut self,
        mut arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if arguments.is_empty() {
            return Ok(Vec::new());
        }

        let stream_id = match arguments.remove(0) {
            Amf0Value::Number(id) => id as u32,
            _ => return Ok(Vec::new()),
        };

        self.close_stream(stream_id)
    }

    fn close_stream(
        &mut self,
        stream_id: u32,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let stream = match self.active_streams.remove(&stream_id) {
            Some(stream) => stream,
            None => return Ok(Vec::new()),
        };

        let app_name = match self.connected_app_name {
            Some(ref name) => name.clone(),
            None => return Ok(Vec::new()),
        };

        let mut results = Vec::new();
        match stream.current_state {
            StreamState::Publishing { stream_key, .. } => {
                let packet = self.create_status(
                    stream_id,
                    status::LEVEL_STATUS,
                    status::UNPUBLISH_SUCCESS,
                    "Publishing stopped",
                )?;
                results.push(ServerSessionResult::OutboundResponse(packet));
                results.push(ServerSessionResult::RaisedEvent(
                    ServerSessionEvent::PublishStreamFinished {
                        app_name,
                        instance_name: self.instance_name.clone(),
                        stream_key,
                    },
                ));
            }

            StreamState::Playing { stream_key } => {
                results.push(ServerSessionResult::RaisedEvent(
                    ServerSessionEvent::PlayStreamFinished {
                        app_name,
                        instance_name: self.instance_name.clone(),
                        stream_key,
                    },
                ));
            }

            StreamState::Created => (),
        }

        Ok(results)
    }

    fn handle_command_response(
        &mut self,
        is_error: bool,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_values: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::CommandResponseReceived {
                transaction_id,
                is_error,
                command_object,
                additional_values,
            },
        )])
    }

    fn handle_amf0_data(
        &mut self,
        mut data: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        // @setDataFrame wraps the actual data frame name
        if let Amf0Value::Utf8String(ref name) = data[0] {
            if name == "@setDataFrame" {
                data.remove(0);
            }
        }

        if data.len() < 2 {
            return Ok(Vec::new());
        }

        match data[0] {
            Amf0Value::Utf8String(ref name) if name == "onMetaData" => (),
            _ => return Ok(Vec::new()),
        }

        let app_name = match self.connected_app_name {
            Some(ref name) => name.clone(),
            None => return Ok(Vec::new()),
        };

        let stream_key = match self.publishing_stream_key(stream_id) {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };

        let mut metadata = StreamMetadata::new();
        if let Some(properties) = data.remove(1).get_object_properties() {
            metadata.apply_metadata_values(&properties);
        }

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::StreamMetadataChanged {
                app_name,
                stream_key,
                metadata,
            },
        )])
    }

    fn handle_audio_data(
        &mut self,
        data: Bytes,
        stream_id: u32,
        timestamp: RtmpTimestamp,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let app_name = match self.connected_app_name {
            Some(ref name) => name.clone(),
            None => return Ok(Vec::new()),
        };

        let stream_key = match self.publishing_stream_key(stream_id) {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::AudioDataReceived {
                app_name,
                stream_key,
                data,
                timestamp,
            },
        )])
    }

    fn handle_video_data(
        &mut self,
        data: Bytes,
        stream_id: u32,
        timestamp: RtmpTimestamp,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let app_name = match self.connected_app_name {
            Some(ref name) => name.clone(),
            None => return Ok(Vec::new()),
        };

        let stream_key = match self.publishing_stream_key(stream_id) {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };

        Ok(vec![ServerSessionResult::RaisedEvent(
            ServerSessionEvent::VideoDataReceived {
                app_name,
                stream_key,
                data,
                timestamp,
            },
        )])
    }

    fn publishing_stream_key(&self, stream_id: u32) -> Option<String> {
        match self.active_streams.get(&stream_id) {
            Some(stream) => match stream.current_state {
                StreamState::Publishing { ref stream_key, .. } => Some(stream_key.clone()),
                _ => None,
            },
            None => None,
        }
    }

    fn create_status(
        &mut self,
        stream_id: u32,
        level: &str,
        code: &str,
        description: &str,
    ) -> Result<Packet, ServerSessionError> {
        self.create_command(
            "onStatus".to_string(),
            0.0,
            Amf0Value::Null,
            vec![Amf0Value::Object(status_object(level, code, description))],
            stream_id,
        )
    }

    fn create_command(
        &mut self,
        name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::Amf0Command {
            command_name: name,
            transaction_id,
            command_object,
            additional_arguments,
        };

        self.serialize_message(message, RtmpTimestamp::new(0), stream_id, false)
    }

    fn serialize_message(
        &mut self,
        message: RtmpMessage,
        timestamp: RtmpTimestamp,
        stream_id: u32,
        can_be_dropped: bool,
    ) -> Result<Packet, ServerSessionError> {
        let payload = MessagePayload::from_rtmp_message_with_encoding(
            message,
            timestamp,
            stream_id,
            self.object_encoding == 3.0,
        )?;

        let packet = self.serializer.serialize(&payload, false, can_be_dropped)?;
        Ok(packet)
    }

    fn current_epoch(&self) -> RtmpTimestamp {
        match self.start_time.elapsed() {
            Ok(elapsed) => RtmpTimestamp::new(elapsed.as_millis() as u32),
            Err(_) => RtmpTimestamp::new(0),
        }
    }
}

fn status_object(level: &str, code: &str, description: &str) -> Amf0Object {
    let mut object = Amf0Object::new();
    object.insert("level", Amf0Value::Utf8String(level.to_string()));
    object.insert("code", Amf0Value::Utf8String(code.to_string()));
    object.insert("description", Amf0Value::Utf8String(description.to_string()));
    object
}

fn fms_version_number(fms_version: &str) -> String {
    match fms_version.split_once('/') {
        Some((_, version)) => version.to_string(),
        None => fms_version.to_string(),
    }
}
