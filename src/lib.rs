//! Asterisk Manager Interface (AMI) client and FastAGI server for tokio
//!
//! # Architecture
//!
//! The client uses a split reader/writer design:
//! - [`ManagerConnection`] (Clone + Send): send actions from any task
//! - [`ManagerEventStream`]: receive events no listener claimed
//!
//! A background reader frames the socket into packets. Responses are matched
//! to their callers by the `ActionID` the client embeds in every action;
//! events are classified through an [`EventRegistry`] and handed to listeners.
//! Lost sessions are re-established with backoff once the first login worked.
//!
//! # Examples
//!
//! ## Actions and events
//!
//! ```rust,no_run
//! use asterisk_manager_tokio::{AmiError, ManagerAction, ManagerConfig, ManagerConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let config = ManagerConfig::new("127.0.0.1", "admin", "secret");
//!     let (manager, mut events) = ManagerConnection::new(config);
//!     manager.login().await?;
//!     println!("Connected to Asterisk {:?}", manager.version());
//!
//!     let originate = ManagerAction::originate("SIP/100")?
//!         .field("Context", "default")?
//!         .field("Exten", "200")?
//!         .field("Priority", "1")?
//!         .variable("CALLER_TAG", "crm-42")?
//!         .action_id("crm-42");
//!     let reply = manager.send_action(originate).await?.into_result()?;
//!     println!("{:?}", reply.message());
//!
//!     while let Some(Ok(event)) = events.recv().await {
//!         println!("{} on {:?}", event.name(), event.channel());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Listing with event-generating actions
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use asterisk_manager_tokio::{AmiError, ManagerAction, ManagerConfig, ManagerConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let (manager, _events) = ManagerConnection::new(ManagerConfig::new("pbx", "admin", "secret"));
//!     manager.login().await?;
//!
//!     let peers = manager
//!         .send_event_generating_action(ManagerAction::sip_peers(), Duration::from_secs(5))
//!         .await?
//!         .into_result()?;
//!     for peer in peers.events().iter().filter(|e| !e.is_list_terminal()) {
//!         println!("{:?} {:?}", peer.text("objectname"), peer.text("status"));
//!     }
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## FastAGI
//!
//! See [`agi::AgiServer`].

#[macro_use]
mod macros;

pub mod action;
pub mod agi;
pub mod auth;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod framer;
pub mod headers;
pub mod protocol;
pub mod response;
pub mod version;

pub(crate) mod correlator;
pub(crate) mod keepalive;

pub use action::ManagerAction;
pub use config::{AgiServerConfig, DispatchMode, ManagerConfig, ReconnectPolicy};
pub use connection::{ConnectionState, DisconnectReason, ManagerConnection, ManagerEventStream};
pub use constants::{DEFAULT_AGI_PORT, DEFAULT_AMI_PORT};
pub use correlator::ResponseCallback;
pub use error::{AgiError, AgiResult, AmiError, AmiResult};
pub use event::{
    Capabilities, EventKindDef, EventRegistry, FieldType, FieldValue, ManagerEvent,
    SubscriptionId,
};
pub use headers::ManagerHeader;
pub use response::{ManagerResponse, ResponseEvents, ResponseStatus};
pub use version::AsteriskVersion;
