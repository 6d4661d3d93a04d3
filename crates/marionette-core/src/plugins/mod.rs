//! Built-in action plugins.
//!
//! The `fte` module moves cells through the format-transforming channel;
//! the `io` module writes and expects literal bytes, used by formats that
//! imitate plaintext banners.

mod fte;
mod io;

use std::sync::Arc;

use crate::plugin::PluginRegistry;

/// Registers the built-ins. Order is fixed so startup is deterministic.
pub(crate) fn register_builtins(registry: &mut PluginRegistry) {
    let send = Arc::new(fte::Send);
    registry.register("fte", "send", send.clone());
    registry.register("fte", "send_async", send);
    registry.register("fte", "recv", Arc::new(fte::Recv { blocking: true }));
    registry.register("fte", "recv_async", Arc::new(fte::Recv { blocking: false }));
    registry.register("io", "puts", Arc::new(io::Puts));
    registry.register("io", "gets", Arc::new(io::Gets));
}
