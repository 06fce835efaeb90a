//! Handling of the RTMP handshake.
//!
//! The handshake exchanges three packets in each direction (p0 the version
//! byte, p1 a timestamped random block, p2 an echo of the peer's p1).  When
//! the four bytes at offset 4 of the client's p1 are non-zero the client is
//! using the digest flavor: its p1 hides an HMAC-SHA-256 digest which must be
//! validated, and our own p1/p2 must carry matching digests.  A client whose
//! digest fails both offset schemes is served with the plain echo handshake
//! instead of being rejected.

mod digest;
mod errors;

pub use self::errors::HandshakeError;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

const RANDOM_DATA_SIZE: usize = 1528;
const PACKET_SIZE: usize = 8 + RANDOM_DATA_SIZE;

/// Which side of the handshake we are performing
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum PeerType {
    Client,
    Server,
}

/// The result of processing inbound handshake bytes
#[derive(Eq, PartialEq, Debug)]
pub enum HandshakeProcessResult {
    /// The handshake needs more bytes before it can complete
    InProgress { response_bytes: Vec<u8> },

    /// The handshake has completed.  Any bytes that arrived after the final
    /// handshake packet are returned so they can be fed to the chunk
    /// deserializer.
    Completed {
        response_bytes: Vec<u8>,
        remaining_bytes: Vec<u8>,
    },
}

#[derive(Eq, PartialEq, Debug, Clone)]
enum Stage {
    NeedToSendP0AndP1,
    WaitingForPacket0,
    WaitingForPacket1,
    WaitingForPacket2,
    Complete,
}

/// Drives one side of an RTMP handshake as a byte-fed state machine
pub struct Handshake {
    peer_type: PeerType,
    current_stage: Stage,
    my_p1: Vec<u8>,
    verify_p2_echo: bool,
    buffer: Vec<u8>,
}

impl Handshake {
    pub fn new(peer_type: PeerType) -> Handshake {
        let stage = match peer_type {
            PeerType::Client => Stage::NeedToSendP0AndP1,
            PeerType::Server => Stage::WaitingForPacket0,
        };

        Handshake {
            peer_type,
            current_stage: stage,
            my_p1: Vec::new(),
            verify_p2_echo: true,
            buffer: Vec::new(),
        }
    }

    /// Creates the outbound p0 and p1 packets.  Clients send these
    /// unprompted; a server instead forms them while reacting to the
    /// client's p1, so this is only valid for the client peer type.
    pub fn generate_outbound_p0_and_p1(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let mut bytes = Vec::with_capacity(1 + PACKET_SIZE);
        bytes.push(3_u8);
        bytes.extend_from_slice(&create_p1());

        self.my_p1 = bytes[1..].to_vec();
        if self.current_stage == Stage::NeedToSendP0AndP1 {
            self.current_stage = Stage::WaitingForPacket0;
        }

        Ok(bytes)
    }

    /// Feeds inbound bytes into the handshake.  Responses must be sent to
    /// the peer in order and without interleaving any other bytes.
    pub fn process_bytes(&mut self, data: &[u8]) -> Result<HandshakeProcessResult, HandshakeError> {
        self.buffer.extend_from_slice(data);

        let mut responses: Vec<u8> = Vec::new();

        loop {
            let starting_stage = self.current_stage.clone();
            let result = match self.current_stage {
                Stage::NeedToSendP0AndP1 => {
                    let bytes = self.generate_outbound_p0_and_p1()?;
                    responses.extend(bytes);
                    continue;
                }
                Stage::WaitingForPacket0 => self.parse_p0()?,
                Stage::WaitingForPacket1 => self.parse_p1()?,
                Stage::WaitingForPacket2 => self.parse_p2()?,
                Stage::Complete => return Err(HandshakeError::HandshakeAlreadyCompleted),
            };

            responses.extend(result);

            if self.current_stage == Stage::Complete || starting_stage == self.current_stage {
                // Still on the same stage means not enough bytes arrived yet
                break;
            }
        }

        if self.current_stage == Stage::Complete {
            Ok(HandshakeProcessResult::Completed {
                response_bytes: responses,
                remaining_bytes: std::mem::take(&mut self.buffer),
            })
        } else {
            Ok(HandshakeProcessResult::InProgress {
                response_bytes: responses,
            })
        }
    }

    fn parse_p0(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        match self.buffer.remove(0) {
            3 => {
                self.current_stage = Stage::WaitingForPacket1;
                Ok(Vec::new())
            }

            _ => Err(HandshakeError::BadVersionId),
        }
    }

    fn parse_p1(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.buffer.len() < PACKET_SIZE {
            return Ok(Vec::new());
        }

        let their_p1: Vec<u8> = self.buffer.drain(..PACKET_SIZE).collect();
        self.current_stage = Stage::WaitingForPacket2;

        match self.peer_type {
            PeerType::Client => {
                // Echo their p1 back as our p2
                Ok(their_p1)
            }

            PeerType::Server => self.respond_to_c1(&their_p1),
        }
    }

    /// Forms the full server reply to c0+c1: s0, s1 and s2 back to back.
    fn respond_to_c1(&mut self, c1: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let digest_requested = BigEndian::read_u32(&c1[4..8]) != 0;
        let validated = if digest_requested {
            digest::validate_client(c1)
        } else {
            None
        };

        let mut response = Vec::with_capacity(1 + PACKET_SIZE * 2);
        response.push(3_u8);

        let mut s1 = create_p1();
        match validated {
            Some((c1_digest, middle)) => {
                digest::sign_s1(&mut s1, middle)?;
                response.extend_from_slice(&s1);

                let mut random = [0_u8; PACKET_SIZE - digest::DIGEST_SIZE];
                rand::thread_rng().fill(&mut random[..]);
                response.extend(digest::make_s2(&c1_digest, &random));

                // A digest client answers s1 with its own keyed digest, not
                // a byte-for-byte echo, so p2 cannot be compared directly.
                self.verify_p2_echo = false;
            }

            None => {
                // Plain path, also taken when the digest fails both probes:
                // s2 is the client's own c1 echoed back.
                response.extend_from_slice(&s1);
                response.extend_from_slice(c1);
            }
        }

        self.my_p1 = s1;
        Ok(response)
    }

    fn parse_p2(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.buffer.len() < PACKET_SIZE {
            return Ok(Vec::new());
        }

        let p2: Vec<u8> = self.buffer.drain(..PACKET_SIZE).collect();

        if self.verify_p2_echo {
            if p2[0..4] != self.my_p1[0..4] {
                return Err(HandshakeError::IncorrectPeerTime);
            }

            if p2[8..] != self.my_p1[8..] {
                return Err(HandshakeError::IncorrectRandomData);
            }
        }

        self.current_stage = Stage::Complete;
        Ok(Vec::new())
    }
}

fn create_p1() -> Vec<u8> {
    let mut packet = vec![0_u8; PACKET_SIZE];
    rand::thread_rng().fill(&mut packet[8..]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unwrap_in_progress(result: HandshakeProcessResult) -> Vec<u8> {
        match result {
            HandshakeProcessResult::InProgress { response_bytes } => response_bytes,
            x => panic!("Expected InProgress, got {:?}", x),
        }
    }

    #[test]
    fn server_starts_waiting_for_packet_0() {
        let handshake = Handshake::new(PeerType::Server);
        assert_eq!(handshake.current_stage, Stage::WaitingForPacket0);
    }

    #[test]
    fn gives_error_on_incoming_p0_with_non_3_version() {
        let mut handshake = Handshake::new(PeerType::Server);

        match handshake.process_bytes(&[4_u8]) {
            Err(HandshakeError::BadVersionId) => (),
            x => panic!("Expected BadVersionId, got {:?}", x),
        }
    }

    #[test]
    fn server_reply_to_simple_c1_is_3073_bytes_with_leading_version() {
        let mut c0c1 = vec![3_u8];
        c0c1.extend(create_p1());

        let mut handshake = Handshake::new(PeerType::Server);
        let response = unwrap_in_progress(handshake.process_bytes(&c0c1).unwrap());

        // s0 + s1 (the first 1537 bytes, starting with the version byte)
        // followed by s2 echoing c1
        assert_eq!(response.len(), 1 + PACKET_SIZE * 2);
        assert_eq!(response[0], 3);
        assert_eq!(&response[1 + PACKET_SIZE..], &c0c1[1..]);
    }

    #[test]
    fn server_accepts_c1_whose_digest_fails_both_schemes() {
        // Non-zero version field but garbage digest: must fall back to the
        // plain path instead of erroring, with s2 echoing c1.
        let mut c1 = create_p1();
        c1[4..8].copy_from_slice(&[0x80, 0x00, 0x07, 0x02]);

        let mut c0c1 = vec![3_u8];
        c0c1.extend_from_slice(&c1);

        let mut handshake = Handshake::new(PeerType::Server);
        let response = unwrap_in_progress(handshake.process_bytes(&c0c1).unwrap());

        assert_eq!(response.len(), 1 + PACKET_SIZE * 2);
        assert_eq!(&response[1 + PACKET_SIZE..], &c1[..]);
    }

    #[test]
    fn server_consumes_exactly_3073_bytes_before_completing() {
        let mut handshake = Handshake::new(PeerType::Server);

        let mut c0c1 = vec![3_u8];
        c0c1.extend(create_p1());
        let response = unwrap_in_progress(handshake.process_bytes(&c0c1).unwrap());

        // c2 echoes s1
        let c2 = response[1..1 + PACKET_SIZE].to_vec();
        let mut with_extra = c2.clone();
        with_extra.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        match handshake.process_bytes(&with_extra).unwrap() {
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                assert_eq!(response_bytes.len(), 0);
                assert_eq!(remaining_bytes, vec![0xAA, 0xBB, 0xCC]);
            }
            x => panic!("Expected Completed, got {:?}", x),
        }
    }

    #[test]
    fn error_when_p2_echo_has_bad_random_data() {
        let mut handshake = Handshake::new(PeerType::Server);

        let mut c0c1 = vec![3_u8];
        c0c1.extend(create_p1());
        let response = unwrap_in_progress(handshake.process_bytes(&c0c1).unwrap());

        let mut c2 = response[1..1 + PACKET_SIZE].to_vec();
        c2[100] = c2[100].wrapping_add(1);

        match handshake.process_bytes(&c2) {
            Err(HandshakeError::IncorrectRandomData) => (),
            x => panic!("Expected IncorrectRandomData, got {:?}", x),
        }
    }

    #[test]
    fn client_and_server_handshakes_complete_against_each_other() {
        let mut client = Handshake::new(PeerType::Client);
        let mut server = Handshake::new(PeerType::Server);

        let c0c1 = client.generate_outbound_p0_and_p1().unwrap();
        let server_reply = unwrap_in_progress(server.process_bytes(&c0c1).unwrap());

        let c2 = match client.process_bytes(&server_reply).unwrap() {
            HandshakeProcessResult::Completed { response_bytes, .. } => response_bytes,
            HandshakeProcessResult::InProgress { response_bytes } => response_bytes,
        };

        match server.process_bytes(&c2).unwrap() {
            HandshakeProcessResult::Completed { .. } => (),
            x => panic!("Server did not complete: {:?}", x),
        }
    }

    #[test]
    fn bytes_after_completion_are_rejected() {
        let mut handshake = Handshake::new(PeerType::Server);

        let mut c0c1 = vec![3_u8];
        c0c1.extend(create_p1());
        let response = unwrap_in_progress(handshake.process_bytes(&c0c1).unwrap());

        let c2 = response[1..1 + PACKET_SIZE].to_vec();
        handshake.process_bytes(&c2).unwrap();

        match handshake.process_bytes(&[1, 2, 3]) {
            Err(HandshakeError::HandshakeAlreadyCompleted) => (),
            x => panic!("Expected HandshakeAlreadyCompleted, got {:?}", x),
        }
    }
}
