//! Debug sinks for handshake dumps.

use tracing::debug;

/// Receives request and response dumps produced while dialing.
pub trait DebugPrinter: Send + Sync {
    fn print(&self, title: &str, dump: &str);
}

/// Discards everything. Installed by default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDebugPrinter;

impl DebugPrinter for NullDebugPrinter {
    fn print(&self, _title: &str, _dump: &str) {}
}

/// Forwards dumps to `tracing` at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDebugPrinter;

impl DebugPrinter for TracingDebugPrinter {
    fn print(&self, title: &str, dump: &str) {
        debug!(event = "websocket_dump", title, dump);
    }
}
