//! SMB2/SMB3 protocol engine
//!
//! A non-blocking, event-driven SMB2/3 engine usable from any event loop.
//! A [`connection::Context`] owns one TCP connection and exposes the
//! descriptor and the events it wants; the application polls and calls
//! [`connection::Context::service`]. On top of that sit the asynchronous
//! client operations, a blocking facade, a DCE/RPC layer over named pipes
//! and a server role that routes requests to application handlers.

#![allow(missing_docs)]
#![deny(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod dcerpc;
pub mod error;
pub mod protocol;
pub mod transport;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

#[cfg(all(test, feature = "client", feature = "server"))]
mod e2e_tests;

pub use connection::{Context, ContextConfig, Events, Pdu, PduId, Reply};
pub use error::{Error, NtStatus, Result};
