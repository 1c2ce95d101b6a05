//! Wire types and framing shared by every ingress and consumer:
//! [`Serno`], [`Message`]/[`Envelope`], [`Topic`], and [`LineReader`].

mod line_reader;
mod message;
mod serno;
mod timestamp;
pub mod topic;

pub use line_reader::{LineOutcome, LineReader, MAX_LINE_LEN};
pub use message::{Envelope, Message, SENDER_ME};
pub use serno::{InvalidSerno, Serno};
pub use timestamp::Timestamp;
pub use topic::Topic;
