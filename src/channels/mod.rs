//! Mailbox and terminal I/O.

pub mod cli;
pub mod imap;
pub mod parse;

pub use cli::Console;
pub use imap::{ImapConfig, ImapInbox};
