/// Short string tag used by the bus to route messages.
///
/// Externally sourced messages use the first byte of their text as the
/// topic. `Topic::WILDCARD` subscribes to every topic.
pub type Topic = char;

pub const DISCONNECT: Topic = '0';
pub const CONNECT: Topic = '1';
pub const SYNC_LAUNCHED: Topic = '2';
pub const SYNC_PENDING: Topic = '3';
pub const GPS: Topic = 'G';
pub const MACHINE_INFO: Topic = 'M';
pub const TIME_SYNC: Topic = 'C';
pub const DEVICE_SETTING: Topic = 'S';
pub const DEVICE_ADDED: Topic = 'A';
pub const DEVICE_REMOVED: Topic = 'R';
pub const TAG_DETECTION: Topic = 'p';

pub const WILDCARD: Topic = '*';

/// Derives the topic for externally sourced text: its first byte.
pub fn topic_of(text: &str) -> Topic {
    text.chars().next().unwrap_or(WILDCARD)
}
