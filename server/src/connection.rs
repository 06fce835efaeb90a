//! Per-connection socket plumbing: a reader thread that forwards received
//! bytes and a writer thread that drains an outbound queue.  The handshake
//! is driven here; everything after it goes through the server.

use lml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

const BUFFER_SIZE: usize = 4096;

pub enum ReadResult {
    HandshakingInProgress,
    NoBytesReceived,
    BytesReceived {
        buffer: [u8; BUFFER_SIZE],
        byte_count: usize,
    },
}

#[derive(Debug)]
pub enum ConnectionError {
    IoError(io::Error),
    SocketClosed,
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        ConnectionError::IoError(error)
    }
}

pub struct Connection {
    pub connection_id: Option<usize>,
    pub remote_addr: String,
    writer: Sender<Vec<u8>>,
    reader: Receiver<ReadResult>,
    handshake: Handshake,
    handshake_completed: bool,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        let remote_addr = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        let (byte_sender, byte_receiver) = channel();
        let (result_sender, result_receiver) = channel();

        start_byte_writer(byte_receiver, &socket);
        start_result_reader(result_sender, &socket);

        Connection {
            connection_id: None,
            remote_addr,
            writer: byte_sender,
            reader: result_receiver,
            handshake: Handshake::new(PeerType::Server),
            handshake_completed: false,
        }
    }

    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.writer.send(bytes);
    }

    pub fn read(&mut self) -> Result<ReadResult, ConnectionError> {
        match self.reader.try_recv() {
            Err(TryRecvError::Empty) => Ok(ReadResult::NoBytesReceived),
            Err(TryRecvError::Disconnected) => Err(ConnectionError::SocketClosed),
            Ok(result) => match self.handshake_completed {
                true => Ok(result),
                false => match result {
                    ReadResult::HandshakingInProgress => unreachable!(),
                    ReadResult::NoBytesReceived => Ok(result),
                    ReadResult::BytesReceived { buffer, byte_count } => {
                        self.handle_handshake_bytes(&buffer[..byte_count])
                    }
                },
            },
        }
    }

    fn handle_handshake_bytes(&mut self, bytes: &[u8]) -> Result<ReadResult, ConnectionError> {
        let result = match self.handshake.process_bytes(bytes) {
            Ok(result) => result,
            Err(handshake_error) => {
                debug!(error = %handshake_error, "handshake failed");
                return Err(ConnectionError::SocketClosed);
            }
        };

        match result {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    self.write(response_bytes);
                }

                Ok(ReadResult::HandshakingInProgress)
            }

            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                debug!(addr = %self.remote_addr, "handshake completed");
                if !response_bytes.is_empty() {
                    self.write(response_bytes);
                }

                let mut buffer = [0; BUFFER_SIZE];
                let byte_count = remaining_bytes.len().min(BUFFER_SIZE);
                buffer[..byte_count].copy_from_slice(&remaining_bytes[..byte_count]);

                self.handshake_completed = true;
                Ok(ReadResult::BytesReceived { buffer, byte_count })
            }
        }
    }
}

fn start_byte_writer(byte_receiver: Receiver<Vec<u8>>, socket: &TcpStream) {
    let mut socket = match socket.try_clone() {
        Ok(socket) => socket,
        Err(clone_error) => {
            error!(error = %clone_error, "failed to clone socket for writing");
            return;
        }
    };

    thread::spawn(move || {
        let mut send_queue = VecDeque::new();

        loop {
            loop {
                match byte_receiver.try_recv() {
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                    Ok(bytes) => send_queue.push_back(bytes),
                }
            }

            match send_queue.pop_front() {
                None => thread::sleep(Duration::from_millis(1)),
                Some(bytes) => {
                    if let Err(write_error) = socket.write_all(&bytes) {
                        debug!(error = %write_error, "socket write failed");
                        return;
                    }
                }
            }
        }
    });
}

fn start_result_reader(sender: Sender<ReadResult>, socket: &TcpStream) {
    let mut socket = match socket.try_clone() {
        Ok(socket) => socket,
        Err(clone_error) => {
            error!(error = %clone_error, "failed to clone socket for reading");
            return;
        }
    };

    thread::spawn(move || {
        let mut buffer = [0; BUFFER_SIZE];
        loop {
            match socket.read(&mut buffer) {
                Ok(0) => return, // socket closed
                Ok(read_count) => {
                    let mut send_buffer = [0; BUFFER_SIZE];
                    send_buffer[..read_count].copy_from_slice(&buffer[..read_count]);

                    let result = ReadResult::BytesReceived {
                        buffer: send_buffer,
                        byte_count: read_count,
                    };

                    if sender.send(result).is_err() {
                        return;
                    }
                }

                Err(read_error) => {
                    debug!(error = %read_error, "socket read failed");
                    return;
                }
            }
        }
    });
}
