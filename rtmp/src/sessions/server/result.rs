use super::ServerSessionEvent;
use crate::chunk_io::Packet;
use crate::messages::MessagePayload;

/// The outcomes of processing bytes or performing actions on a server session
#[derive(Debug)]
pub enum ServerSessionResult {
    /// A packet that must be sent to the client, in order
    OutboundResponse(Packet),

    /// An event for the owning application to act on
    RaisedEvent(ServerSessionEvent),

    /// A message arrived that the session has no handling for
    UnhandleableMessageReceived(MessagePayload),
}
