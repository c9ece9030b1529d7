//! Inter-process messaging for the cluster.
//!
//! Envelopes travel as newline-delimited JSON: master → child over the
//! child's stdin, child → master over the child's stdout. Each channel has
//! a single writer task, so order is preserved per channel and sends never
//! block the caller.

mod channel;
mod envelope;

pub use channel::{ChannelSender, parse_line, read_envelopes};
pub use envelope::{Action, Endpoint, Envelope};
