//! FastAGI server side.
//!
//! Asterisk connects to the [`AgiServer`] when the dialplan runs
//! `AGI(agi://host/script)`. The server reads the [`AgiRequest`], picks a
//! script through a [`ScriptMapper`] and runs it with an [`AgiChannel`] for
//! sending [`AgiCommand`]s.

mod channel;
mod command;
mod mapping;
mod reply;
mod request;
mod server;

pub use channel::{AgiChannel, AgiStream};
pub use command::AgiCommand;
pub use mapping::{AgiScript, ScriptMapper, SimpleMappingStrategy};
pub use reply::AgiReply;
pub use request::AgiRequest;
pub use server::AgiServer;
