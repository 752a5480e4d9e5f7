//! CLI commands module.

mod listen;
mod match_topic;
mod outbox;
mod publish;
mod util;

pub use listen::ListenCommand;
pub use match_topic::MatchCommand;
pub use outbox::OutboxCommand;
pub use publish::PublishCommand;

pub(crate) use util::*;
