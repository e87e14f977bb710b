//! Tether Testing Infrastructure
//!
//! Scripted stand-ins for the broker and the data channel library, so session,
//! listener and peer behaviour can be driven step by step from a test without
//! any network or event-loop timing.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! ```rust,no_run
//! use tether_testkit::*;
//!
//! let channel = ScriptedChannel::new("bob");
//! channel.open();
//! channel.push(&b"Hello World"[..]);
//! ```

pub mod broker;
pub mod channel;
pub mod fixtures;

pub use broker::ScriptedBroker;
pub use channel::ScriptedChannel;
pub use fixtures::*;
