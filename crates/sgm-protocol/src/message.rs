use crate::timestamp::Timestamp;
use crate::topic::Topic;

/// Sender identity for synthetic, internally generated messages.
pub const SENDER_ME: &str = "me";

/// `{timestamp, sender, text}` as described in the data model.
///
/// `timestamp` of `Timestamp::ZERO` means "fill in at consumption".
/// `sender` is typically a [`crate::Serno`] as text, or [`SENDER_ME`].
/// `text` is opaque; its first byte doubles as the bus topic for
/// externally sourced messages (see [`Envelope`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: Timestamp,
    pub sender: String,
    pub text: String,
}

impl Message {
    pub fn new(timestamp: Timestamp, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            timestamp,
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// A message together with the topic it was published under.
///
/// The bus delivers envelopes, not bare messages, because the topic is a
/// routing key independent of (though usually derived from) the message
/// text — e.g. synthetic messages published with an empty `text` still
/// carry a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: Topic,
    pub message: Message,
}

impl Envelope {
    pub fn new(topic: Topic, message: Message) -> Self {
        Envelope { topic, message }
    }
}
