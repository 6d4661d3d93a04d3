//! Test doubles and helpers for exercising the marionette engine.
//!
//! Production deployments plug a real regex-to-DFA cipher engine and real
//! sockets into the core. The harness replaces both with deterministic
//! stand-ins: in-memory duplex byte channels and a reversible hex-envelope
//! cipher whose `close` calls are observable, so resource-release
//! behavior can be asserted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod docs;
pub mod pipe;
pub mod stub;

pub use pipe::pipe;
pub use stub::StubSuite;
