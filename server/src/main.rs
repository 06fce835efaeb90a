use clap::Parser;
use lml_server::config::ServerConfig;
use lml_server::connection::{Connection, ConnectionError, ReadResult};
use lml_server::server::{Server, ServerResult};
use slab::Slab;
use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Live RTMP ingest and fan-out server
#[derive(Parser)]
#[command(name = "lml-server", version)]
struct Args {
    /// Address to listen for RTMP connections on
    #[arg(long, default_value = "0.0.0.0:1935")]
    bind: String,

    /// Outbound chunk size to negotiate (128..=65536)
    #[arg(long)]
    chunk_size: Option<u32>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::default();
    config.bind_address = args.bind;
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size.clamp(128, 65536);
    }

    let listener = match TcpListener::bind(&config.bind_address) {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!(error = %bind_error, address = %config.bind_address, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(address = %config.bind_address, "listening for RTMP connections");

    let (stream_sender, stream_receiver) = channel();
    thread::spawn(move || handle_connections(stream_receiver, config));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if stream_sender.send(stream).is_err() {
                    error!("connection handler thread is gone");
                    return;
                }
            }
            Err(accept_error) => warn!(error = %accept_error, "failed to accept connection"),
        }
    }
}

fn handle_connections(connection_receiver: Receiver<TcpStream>, config: ServerConfig) {
    let mut connections = Slab::new();
    let mut connection_ids = HashSet::new();
    let mut server = Server::new(config);

    loop {
        match connection_receiver.try_recv() {
            Err(TryRecvError::Disconnected) => {
                error!("connection receiver closed");
                return;
            }
            Err(TryRecvError::Empty) => (),
            Ok(stream) => {
                let connection = Connection::new(stream);
                let remote_addr = connection.remote_addr.clone();
                let id = connections.insert(connection);
                let connection: &mut Connection = connections.get_mut(id).unwrap();
                connection.connection_id = Some(id);
                connection_ids.insert(id);
                server.connection_started(id, &remote_addr);

                info!(connection_id = id, addr = %remote_addr, "connection started");
            }
        }

        let mut ids_to_clear = Vec::new();
        let mut packets_to_write = Vec::new();
        for connection_id in &connection_ids {
            let connection = connections.get_mut(*connection_id).unwrap();
            match connection.read() {
                Err(ConnectionError::SocketClosed) => {
                    info!(connection_id, "socket closed");
                    ids_to_clear.push(*connection_id);
                }

                Err(read_error) => {
                    warn!(connection_id, error = ?read_error, "connection read error");
                    ids_to_clear.push(*connection_id);
                }

                Ok(result) => match result {
                    ReadResult::NoBytesReceived => (),
                    ReadResult::HandshakingInProgress => (),
                    ReadResult::BytesReceived { buffer, byte_count } => {
                        let mut server_results =
                            match server.bytes_received(*connection_id, &buffer[..byte_count]) {
                                Ok(results) => results,
                                Err(server_error) => {
                                    warn!(connection_id, error = %server_error, "closing connection");
                                    ids_to_clear.push(*connection_id);
                                    continue;
                                }
                            };

                        for result in server_results.drain(..) {
                            match result {
                                ServerResult::OutboundPacket {
                                    target_connection_id,
                                    packet,
                                } => {
                                    packets_to_write.push((target_connection_id, packet));
                                }

                                ServerResult::DisconnectConnection {
                                    connection_id: id_to_close,
                                } => {
                                    ids_to_clear.push(id_to_close);
                                }
                            }
                        }
                    }
                },
            }
        }

        for (connection_id, packet) in packets_to_write.drain(..) {
            if let Some(connection) = connections.get_mut(connection_id) {
                connection.write(packet.bytes);
            }
        }

        for closed_id in ids_to_clear {
            if connection_ids.remove(&closed_id) {
                info!(connection_id = closed_id, "connection closed");
                connections.remove(closed_id);
                server.notify_connection_closed(closed_id);
            }
        }
    }
}
