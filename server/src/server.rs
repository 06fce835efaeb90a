//! Orchestrates RTMP sessions over the routing directory: accepts
//! connections, binds publishers to streams, primes and feeds players, and
//! fires the lifecycle webhooks.

use crate::config::ServerConfig;
use crate::notify::{Notifier, NotifyEvent};
use crate::router::{Router, RouterError, Stream};
use bytes::Bytes;
use lml_av::recorder::{expand_template, FileSink, FlvRecorder, MediaRecorderConstraints};
use lml_av::format::mode;
use lml_rtmp::chunk_io::Packet;
use lml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};
use lml_rtmp::time::RtmpTimestamp;
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

enum ClientAction {
    Waiting,
    Publishing {
        stream: Arc<Stream>,
    },
    Watching {
        stream: Arc<Stream>,
        stream_id: u32,
    },
}

struct Client {
    session: ServerSession,
    current_action: ClientAction,
    connection_id: usize,
    has_received_video_keyframe: bool,
}

impl Client {
    fn watching_stream_id(&self) -> Option<u32> {
        match self.current_action {
            ClientAction::Watching { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }
}

enum ReceivedDataType {
    Audio,
    Video,
}

/// What the connection loop must do after feeding bytes into the server
#[derive(Debug)]
pub enum ServerResult {
    DisconnectConnection {
        connection_id: usize,
    },
    OutboundPacket {
        target_connection_id: usize,
        packet: Packet,
    },
}

pub struct Server {
    config: ServerConfig,
    notifier: Notifier,
    router: Router,
    clients: Slab<Client>,
    connection_to_client_map: HashMap<usize, usize>,
    remote_addrs: HashMap<usize, String>,
    watchers: HashMap<String, HashSet<usize>>,
}

fn stream_key_of(stream: &Stream) -> String {
    format!(
        "{}/{}/{}",
        stream.app_name, stream.instance_name, stream.name
    )
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let notifier = Notifier::new(config.notify.clone());

        Server {
            config,
            notifier,
            router: Router::new(),
            clients: Slab::with_capacity(1024),
            connection_to_client_map: HashMap::with_capacity(1024),
            remote_addrs: HashMap::new(),
            watchers: HashMap::new(),
        }
    }

    /// Records the peer address of a new connection for notifications
    pub fn connection_started(&mut self, connection_id: usize, remote_addr: &str) {
        self.remote_addrs
            .insert(connection_id, remote_addr.to_string());
    }

    /// Feeds post-handshake bytes from a connection through its session
    pub fn bytes_received(
        &mut self,
        connection_id: usize,
        bytes: &[u8],
    ) -> Result<Vec<ServerResult>, String> {
        let mut server_results = Vec::new();

        if !self.connection_to_client_map.contains_key(&connection_id) {
            let config = ServerSessionConfig {
                chunk_size: self.config.chunk_size,
                window_ack_size: self.config.window_ack_size,
                peer_bandwidth: self.config.peer_bandwidth,
                ..ServerSessionConfig::new()
            };

            let session = ServerSession::new(config);
            let client = Client {
                session,
                connection_id,
                current_action: ClientAction::Waiting,
                has_received_video_keyframe: false,
            };

            let client_id = self.clients.insert(client);
            self.connection_to_client_map.insert(connection_id, client_id);
        }

        let session_results = {
            let client_id = self.connection_to_client_map[&connection_id];
            let client = self.clients.get_mut(client_id).unwrap();
            match client.session.handle_input(bytes) {
                Ok(results) => results,
                Err(error) => return Err(error.to_string()),
            }
        };

        self.handle_session_results(connection_id, session_results, &mut server_results);
        Ok(server_results)
    }

    /// Cleans up a connection that went away
    pub fn notify_connection_closed(&mut self, connection_id: usize) {
        let remote_addr = self
            .remote_addrs
            .remove(&connection_id)
            .unwrap_or_default();

        if let Some(client_id) = self.connection_to_client_map.remove(&connection_id) {
            let client = self.clients.remove(client_id);
            match client.current_action {
                ClientAction::Publishing { stream } => {
                    self.publishing_ended(&stream, &remote_addr);
                }
                ClientAction::Watching { stream, .. } => {
                    self.watching_ended(client_id, &stream, &remote_addr);
                }
                ClientAction::Waiting => (),
            }
        }

        let _ = self
            .notifier
            .notify(NotifyEvent::OnClose, &remote_addr, "", "", "");
    }

    fn remote_addr(&self, connection_id: usize) -> String {
        self.remote_addrs
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    fn handle_session_results(
        &mut self,
        executed_connection_id: usize,
        session_results: Vec<ServerSessionResult>,
        server_results: &mut Vec<ServerResult>,
    ) {
        for result in session_results {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    server_results.push(ServerResult::OutboundPacket {
                        target_connection_id: executed_connection_id,
                        packet,
                    })
                }

                ServerSessionResult::RaisedEvent(event) => {
                    self.handle_raised_event(executed_connection_id, event, server_results)
                }

                ServerSessionResult::UnhandleableMessageReceived(payload) => {
                    debug!(type_id = payload.type_id, "unhandleable message received");
                }
            }
        }
    }

    fn handle_raised_event(
        &mut self,
        connection_id: usize,
        event: ServerSessionEvent,
        server_results: &mut Vec<ServerResult>,
    ) {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
                instance_name,
            } => {
                self.handle_connection_requested(
                    connection_id,
                    request_id,
                    &app_name,
                    &instance_name,
                    server_results,
                );
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                instance_name,
                stream_key,
                mode: _,
                stream_id: _,
            } => {
                self.handle_publish_requested(
                    connection_id,
                    request_id,
                    &app_name,
                    &instance_name,
                    &stream_key,
                    server_results,
                );
            }

            ServerSessionEvent::PlayStreamRequested {
                request_id,
                app_name,
                instance_name,
                stream_key,
                stream_id,
                ..
            } => {
                self.handle_play_requested(
                    connection_id,
                    request_id,
                    &app_name,
                    &instance_name,
                    &stream_key,
                    stream_id,
                    server_results,
                );
            }

            ServerSessionEvent::StreamMetadataChanged {
                app_name: _,
                stream_key: _,
                metadata,
            } => {
                self.handle_metadata_received(connection_id, metadata, server_results);
            }

            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                self.handle_media_data_received(
                    connection_id,
                    ReceivedDataType::Audio,
                    data,
                    timestamp,
                    server_results,
                );
            }

            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                self.handle_media_data_received(
                    connection_id,
                    ReceivedDataType::Video,
                    data,
                    timestamp,
                    server_results,
                );
            }

            ServerSessionEvent::PublishStreamFinished { .. } => {
                self.handle_publish_finished(connection_id);
            }

            ServerSessionEvent::PlayStreamFinished { .. } => {
                self.handle_play_finished(connection_id);
            }

            ServerSessionEvent::ClientChunkSizeChanged { new_chunk_size } => {
                debug!(new_chunk_size, "client changed chunk size");
            }

            ServerSessionEvent::AcknowledgementReceived { bytes_received } => {
                debug!(bytes_received, "client acknowledgement");
            }

            ServerSessionEvent::PingResponseReceived { timestamp } => {
                debug!(timestamp = timestamp.value, "ping response");
            }

            ServerSessionEvent::UnhandleableAmf0Command { command_name, .. } => {
                debug!(command = %command_name, "ignored client command");
            }

            ServerSessionEvent::CommandResponseReceived { transaction_id, .. } => {
                debug!(transaction_id, "command response received");
            }
        }
    }

    fn with_client_session<F>(
        &mut self,
        connection_id: usize,
        server_results: &mut Vec<ServerResult>,
        operation: F,
    ) where
        F: FnOnce(&mut ServerSession) -> Result<Vec<ServerSessionResult>, String>,
    {
        let client_id = match self.connection_to_client_map.get(&connection_id) {
            Some(client_id) => *client_id,
            None => return,
        };

        let result = {
            let client = self.clients.get_mut(client_id).unwrap();
            operation(&mut client.session)
        };

        match result {
            Ok(results) => {
                self.handle_session_results(connection_id, results, server_results)
            }
            Err(error) => {
                error!(%error, connection_id, "session operation failed");
                server_results.push(ServerResult::DisconnectConnection { connection_id });
            }
        }
    }

    fn handle_connection_requested(
        &mut self,
        connection_id: usize,
        request_id: u32,
        app_name: &str,
        instance_name: &str,
        server_results: &mut Vec<ServerResult>,
    ) {
        info!(connection_id, app_name, instance_name, "connection requested");

        let remote_addr = self.remote_addr(connection_id);
        if let Err(notify_error) = self.notifier.notify(
            NotifyEvent::OnOpen,
            &remote_addr,
            app_name,
            instance_name,
            "",
        ) {
            warn!(%notify_error, "connection rejected by notification endpoint");
            self.with_client_session(connection_id, server_results, |session| {
                session
                    .reject_request(request_id, "connection rejected")
                    .map_err(|error| error.to_string())
            });
            server_results.push(ServerResult::DisconnectConnection { connection_id });
            return;
        }

        self.with_client_session(connection_id, server_results, |session| {
            session
                .accept_request(request_id)
                .map_err(|error| error.to_string())
        });
    }

    fn handle_publish_requested(
        &mut self,
        connection_id: usize,
        request_id: u32,
        app_name: &str,
        instance_name: &str,
        stream_key: &str,
        server_results: &mut Vec<ServerResult>,
    ) {
        info!(connection_id, app_name, instance_name, stream_key, "publish requested");

        let stream = match self.router.get_stream(app_name, instance_name, stream_key) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "publish refused");
                self.with_client_session(connection_id, server_results, |session| {
                    session
                        .reject_request(request_id, "invalid stream name")
                        .map_err(|error| error.to_string())
                });
                return;
            }
        };

        if let Err(RouterError::AlreadyPublishing) = stream.begin_publishing() {
            warn!(stream_key, "stream key already being published to");
            self.with_client_session(connection_id, server_results, |session| {
                session
                    .reject_request(request_id, "stream key already in use")
                    .map_err(|error| error.to_string())
            });
            server_results.push(ServerResult::DisconnectConnection { connection_id });
            return;
        }

        let remote_addr = self.remote_addr(connection_id);
        if let Err(notify_error) = self.notifier.notify(
            NotifyEvent::Publish,
            &remote_addr,
            app_name,
            instance_name,
            "",
        ) {
            warn!(%notify_error, "publish rejected by notification endpoint");
            stream.end_publishing();
            self.with_client_session(connection_id, server_results, |session| {
                session
                    .reject_request(request_id, "publish rejected")
                    .map_err(|error| error.to_string())
            });
            return;
        }

        {
            let client_id = self.connection_to_client_map[&connection_id];
            let client = self.clients.get_mut(client_id).unwrap();
            client.current_action = ClientAction::Publishing {
                stream: stream.clone(),
            };
        }

        self.start_recorders(&stream, &remote_addr);

        self.with_client_session(connection_id, server_results, |session| {
            session
                .accept_request(request_id)
                .map_err(|error| error.to_string())
        });
    }

    fn start_recorders(&mut self, stream: &Arc<Stream>, remote_addr: &str) {
        for recorder_config in &self.config.recorders {
            let flags = mode::parse(&recorder_config.mode, "|");
            if (flags & mode::OFF) != 0 {
                continue;
            }

            let constraints = MediaRecorderConstraints {
                mode: flags,
                directory: recorder_config.directory.clone(),
                file_name: expand_template(
                    &recorder_config.file_name,
                    &stream.app_name,
                    &stream.instance_name,
                    &stream.name,
                ),
                unique: recorder_config.unique,
                append: recorder_config.append,
                chunks_per_segment: 0,
                segments_per_file: 0,
                max_duration: recorder_config.max_duration,
                max_size: recorder_config.max_size,
                max_frames: recorder_config.max_frames,
            };

            let recorder = FlvRecorder::new(constraints, Box::new(FileSink::new("flv")));
            recorder.set_source(stream.media().clone());

            if (flags & mode::MANUAL) == 0 {
                recorder.start();
                let _ = self.notifier.notify(
                    NotifyEvent::OnRecord,
                    remote_addr,
                    &stream.app_name,
                    &stream.instance_name,
                    "",
                );
            }

            stream.add_recorder(recorder);
        }
    }

    fn handle_play_requested(
        &mut self,
        connection_id: usize,
        request_id: u32,
        app_name: &str,
        instance_name: &str,
        stream_key: &str,
        stream_id: u32,
        server_results: &mut Vec<ServerResult>,
    ) {
        info!(connection_id, app_name, instance_name, stream_key, "play requested");

        let stream = match self.router.find_stream(app_name, instance_name, stream_key) {
            Some(stream) => stream,
            None => {
                self.with_client_session(connection_id, server_results, |session| {
                    session
                        .reject_request(request_id, "no such stream")
                        .map_err(|error| error.to_string())
                });
                return;
            }
        };

        let remote_addr = self.remote_addr(connection_id);
        if let Err(notify_error) = self.notifier.notify(
            NotifyEvent::Play,
            &remote_addr,
            app_name,
            instance_name,
            "",
        ) {
            warn!(%notify_error, "play rejected by notification endpoint");
            self.with_client_session(connection_id, server_results, |session| {
                session
                    .reject_request(request_id, "play rejected")
                    .map_err(|error| error.to_string())
            });
            return;
        }

        let client_id = self.connection_to_client_map[&connection_id];
        {
            let client = self.clients.get_mut(client_id).unwrap();
            client.current_action = ClientAction::Watching {
                stream: stream.clone(),
                stream_id,
            };
            client.has_received_video_keyframe = false;
        }

        self.watchers
            .entry(stream_key_of(&stream))
            .or_default()
            .insert(client_id);

        // Accept, then prime the late subscriber: the last onMetaData, the
        // audio info frame, and the video info frame, in that order
        self.with_client_session(connection_id, server_results, |session| {
            let mut results = session
                .accept_request(request_id)
                .map_err(|error| error.to_string())?;

            let time_base = stream.media().info().read().time_base;

            if let Some(metadata) = stream.metadata() {
                let packet = session
                    .send_metadata(stream_id, &metadata)
                    .map_err(|error| error.to_string())?;
                results.push(ServerSessionResult::OutboundResponse(packet));
            }

            if let Some(info_frame) = stream.audio_info_frame() {
                let timestamp =
                    RtmpTimestamp::new(info_frame.timestamp.wrapping_sub(time_base));
                let packet = session
                    .send_audio_data(stream_id, info_frame.payload.clone(), timestamp, false)
                    .map_err(|error| error.to_string())?;
                results.push(ServerSessionResult::OutboundResponse(packet));
            }

            if let Some(info_frame) = stream.video_info_frame() {
                let timestamp =
                    RtmpTimestamp::new(info_frame.timestamp.wrapping_sub(time_base));
                let packet = session
                    .send_video_data(stream_id, info_frame.payload.clone(), timestamp, false)
                    .map_err(|error| error.to_string())?;
                results.push(ServerSessionResult::OutboundResponse(packet));
            }

            Ok(results)
        });
    }

    fn handle_metadata_received(
        &mut self,
        connection_id: usize,
        metadata: StreamMetadata,
        server_results: &mut Vec<ServerResult>,
    ) {
        let client_id = match self.connection_to_client_map.get(&connection_id) {
            Some(client_id) => *client_id,
            None => return,
        };

        let stream = match &self.clients.get(client_id).unwrap().current_action {
            ClientAction::Publishing { stream } => stream.clone(),
            _ => return,
        };

        stream.set_metadata(metadata.clone());

        // Relay to everyone currently watching
        let watcher_ids: Vec<usize> = self
            .watchers
            .get(&stream_key_of(&stream))
            .map(|watchers| watchers.iter().copied().collect())
            .unwrap_or_default();

        for watcher_id in watcher_ids {
            let watcher = match self.clients.get_mut(watcher_id) {
                Some(watcher) => watcher,
                None => continue,
            };

            let watcher_stream_id = match watcher.watching_stream_id() {
                Some(stream_id) => stream_id,
                None => continue,
            };

            match watcher.session.send_metadata(watcher_stream_id, &metadata) {
                Ok(packet) => server_results.push(ServerResult::OutboundPacket {
                    target_connection_id: watcher.connection_id,
                    packet,
                }),
                Err(error) => {
                    error!(%error, "failed to relay metadata");
                    server_results.push(ServerResult::DisconnectConnection {
                        connection_id: watcher.connection_id,
                    });
                }
            }
        }
    }

    fn handle_media_data_received(
        &mut self,
        connection_id: usize,
        data_type: ReceivedDataType,
        data: Bytes,
        timestamp: RtmpTimestamp,
        server_results: &mut Vec<ServerResult>,
    ) {
        let client_id = match self.connection_to_client_map.get(&connection_id) {
            Some(client_id) => *client_id,
            None => return,
        };

        let stream = match &self.clients.get(client_id).unwrap().current_action {
            ClientAction::Publishing { stream } => stream.clone(),
            _ => return,
        };

        // Parse into the stream model; everything subscribed to the track
        // sources (remuxers, recorders) sees the packet from here
        let sink_result = match data_type {
            ReceivedDataType::Audio => stream.sink_audio(data.clone(), timestamp.value),
            ReceivedDataType::Video => stream.sink_video(data.clone(), timestamp.value),
        };

        if let Err(error) = sink_result {
            error!(%error, connection_id, "dropping publisher");
            server_results.push(ServerResult::DisconnectConnection { connection_id });
            return;
        }

        // Relay the untouched payload to the RTMP watchers
        let watcher_ids: Vec<usize> = self
            .watchers
            .get(&stream_key_of(&stream))
            .map(|watchers| watchers.iter().copied().collect())
            .unwrap_or_default();

        for watcher_id in watcher_ids {
            let watcher = match self.clients.get_mut(watcher_id) {
                Some(watcher) => watcher,
                None => continue,
            };

            let watcher_stream_id = match watcher.watching_stream_id() {
                Some(stream_id) => stream_id,
                None => continue,
            };

            let should_send = match data_type {
                ReceivedDataType::Video => {
                    watcher.has_received_video_keyframe
                        || is_video_sequence_header(&data)
                        || is_video_keyframe(&data)
                }
                ReceivedDataType::Audio => {
                    watcher.has_received_video_keyframe || is_audio_sequence_header(&data)
                }
            };

            if !should_send {
                continue;
            }

            let send_result = match data_type {
                ReceivedDataType::Audio => watcher.session.send_audio_data(
                    watcher_stream_id,
                    data.clone(),
                    timestamp,
                    true,
                ),
                ReceivedDataType::Video => {
                    if is_video_keyframe(&data) {
                        watcher.has_received_video_keyframe = true;
                    }

                    watcher.session.send_video_data(
                        watcher_stream_id,
                        data.clone(),
                        timestamp,
                        true,
                    )
                }
            };

            match send_result {
                Ok(packet) => server_results.push(ServerResult::OutboundPacket {
                    target_connection_id: watcher.connection_id,
                    packet,
                }),
                Err(error) => {
                    error!(%error, "failed to relay media data");
                    server_results.push(ServerResult::DisconnectConnection {
                        connection_id: watcher.connection_id,
                    });
                }
            }
        }
    }

    fn handle_publish_finished(&mut self, connection_id: usize) {
        let client_id = match self.connection_to_client_map.get(&connection_id) {
            Some(client_id) => *client_id,
            None => return,
        };

        let remote_addr = self.remote_addr(connection_id);
        let client = self.clients.get_mut(client_id).unwrap();
        if let ClientAction::Publishing { stream } =
            std::mem::replace(&mut client.current_action, ClientAction::Waiting)
        {
            self.publishing_ended(&stream, &remote_addr);
        }
    }

    fn handle_play_finished(&mut self, connection_id: usize) {
        let client_id = match self.connection_to_client_map.get(&connection_id) {
            Some(client_id) => *client_id,
            None => return,
        };

        let remote_addr = self.remote_addr(connection_id);
        let client = self.clients.get_mut(client_id).unwrap();
        if let ClientAction::Watching { stream, .. } =
            std::mem::replace(&mut client.current_action, ClientAction::Waiting)
        {
            self.watching_ended(client_id, &stream, &remote_addr);
        }
    }

    fn publishing_ended(&mut self, stream: &Arc<Stream>, remote_addr: &str) {
        let was_publishing = stream.is_publishing();
        stream.end_publishing();

        let _ = self.notifier.notify(
            NotifyEvent::Unpublish,
            remote_addr,
            &stream.app_name,
            &stream.instance_name,
            "",
        );

        if was_publishing && !self.config.recorders.is_empty() {
            let _ = self.notifier.notify(
                NotifyEvent::OnRecordDone,
                remote_addr,
                &stream.app_name,
                &stream.instance_name,
                "",
            );
        }

        self.drop_stream_if_idle(stream);
    }

    fn watching_ended(&mut self, client_id: usize, stream: &Arc<Stream>, remote_addr: &str) {
        if let Some(watchers) = self.watchers.get_mut(&stream_key_of(stream)) {
            watchers.remove(&client_id);
        }

        let _ = self.notifier.notify(
            NotifyEvent::Unplay,
            remote_addr,
            &stream.app_name,
            &stream.instance_name,
            "",
        );

        self.drop_stream_if_idle(stream);
    }

    /// Removes the stream from the directory once it is unpublished and the
    /// last subscriber has drained
    fn drop_stream_if_idle(&mut self, stream: &Arc<Stream>) {
        let key = stream_key_of(stream);
        let no_watchers = self
            .watchers
            .get(&key)
            .map(|watchers| watchers.is_empty())
            .unwrap_or(true);

        if no_watchers && !stream.is_publishing() {
            self.watchers.remove(&key);
            self.router
                .remove_stream(&stream.app_name, &stream.instance_name, &stream.name);
        }
    }
}

fn is_video_sequence_header(data: &Bytes) -> bool {
    data.len() >= 2 && data[0] == 0x17 && data[1] == 0x00
}

fn is_audio_sequence_header(data: &Bytes) -> bool {
    data.len() >= 2 && (data[0] >> 4) == 0x0A && data[1] == 0x00
}

fn is_video_keyframe(data: &Bytes) -> bool {
    data.len() >= 2 && data[0] == 0x17 && data[1] != 0x00
}
