//! Chain command submission with timeouts and backoff

mod backoff;
mod sender;

pub use backoff::{backoff_delay, retry_transient};
pub use sender::{ChainCommand, CommandSender};
