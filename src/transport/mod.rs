//! Socket plumbing under the connection engine
//!
//! The engine itself is sans-io apart from non-blocking socket calls; these
//! helpers resolve and open sockets and wait on them.

pub mod poll;
pub mod reactor;
pub mod tcp;
