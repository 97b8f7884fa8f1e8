use crate::{LogRecord, Message, Node, Status};
use std::sync::{Arc, Weak};

/// Where a delivery came from.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub port: usize,
    pub node: Weak<Node>,
}

/// Where a delivery goes. The flow resolves the node from the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
}

/// One message headed for one destination.
///
/// Events from a single `send` call share message instances. When
/// `clone_message` is set the flow must hand the destination its own copy.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub msg: Arc<Message>,
    pub source: Source,
    pub destination: Destination,
    pub clone_message: bool,
}

impl DeliveryEvent {
    /// The message for the destination, copied if required or still shared.
    pub fn take_message(self) -> Message {
        if self.clone_message {
            return (*self.msg).clone();
        }
        Arc::try_unwrap(self.msg).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// What a node needs from the flow that owns it.
pub trait Flow: Send + Sync {
    /// Route a batch of deliveries from one `send` call, in order.
    fn send(&self, events: Vec<DeliveryEvent>);

    /// A node finished with a message.
    fn handle_complete(&self, node: &Node, msg: &Message);

    /// Offer an error to the flow. Returns `true` if something (a catch
    /// node) took responsibility for it.
    fn handle_error(&self, node: &Node, log_message: &str, msg: &Message) -> bool;

    fn handle_status(&self, node: &Node, status: Status);

    fn log(&self, record: LogRecord);
}
