//! Marionette engine: a programmable traffic-shaping transport.
//!
//! A format document describes a finite state machine whose transitions
//! move format-transforming-encrypted cells between two peers, disguising
//! the channel as whatever the document's regular languages imitate.
//! Application data rides on top as multiplexed logical streams.
//!
//! ```text
//!  application        application
//!      │ streams          │ streams
//!  ┌───┴─────┐        ┌───┴─────┐
//!  │ Dialer  │        │ Acceptor│
//!  │  └ Fsm ─┼─ cells ┼─ Fsm ┘  │
//!  └───┬─────┘        └───┬─────┘
//!      └──── transport ───┘
//! ```
//!
//! # Modules
//!
//! - [`fsm`]: transition selection, the instance-id handshake, action
//!   evaluation
//! - [`conn`]: peekable buffered connection with commit-on-seek reads
//! - [`stream`]: the logical stream multiplexer
//! - [`cipher`]: the format-transforming cipher seam and per-machine cache
//! - [`plugin`]: the process-wide action registry
//! - [`dialer`] / [`acceptor`]: long-running drivers for each side
//!
//! The wire types live in `marionette-proto`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod acceptor;
pub mod cipher;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod fsm;
pub mod net;
pub mod plugin;
mod plugins;
pub mod stream;

pub use acceptor::Acceptor;
pub use cipher::{Cipher, CipherSuite};
pub use config::Config;
pub use conn::{BufferedConn, Conn};
pub use dialer::Dialer;
pub use error::{Error, Result};
pub use fsm::{Fsm, STATE_DEAD, STATE_START};
pub use marionette_proto::{Cell, Document, Party, MAX_CELL_LEN};
pub use stream::{Stream, StreamSet};
