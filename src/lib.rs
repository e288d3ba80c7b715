//! signalrtc-core — SIP signalling server core
//!
//! The transport demultiplexer, registrar, B2BUA call-bridging
//! pipeline, subscriber pipeline, abuse filter, dialplan evaluator,
//! call manager, and WebRTC signal relay described in this crate's
//! design documents. The SIP wire parser/transaction/dialog state
//! machine, the HTTP management UI, OAuth login, and the durable
//! database backing the [`store::Store`] trait are external
//! collaborators this crate does not implement.

pub mod abuse;
pub mod auth;
pub mod b2bua;
pub mod call_manager;
pub mod clock;
pub mod config;
pub mod contact;
pub mod dialplan;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod host;
pub mod registrar;
pub mod registry;
pub mod sip;
pub mod store;
pub mod subscriber;
pub mod transport;
pub mod utils;
pub mod webrtc_relay;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
