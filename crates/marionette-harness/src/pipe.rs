//! In-memory byte channels for driving two machines without sockets.

use marionette_core::Conn;

/// Returns two connected byte channels; bytes written to one side are
/// readable on the other.
#[must_use]
pub fn pipe() -> (Box<dyn Conn>, Box<dyn Conn>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(a), Box::new(b))
}
