//! Chat front end: command parsing, the message loop and reply delivery.

pub mod bot_loop;
pub mod command;
pub mod reply;

pub use bot_loop::{Bot, BotDeps};
pub use command::{Command, CommandParser};
pub use reply::ChannelReplySink;
