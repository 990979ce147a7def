//! # pvstream-server
//!
//! Live PV streaming over WebSocket.
//!
//! - [`FanoutManager`] maps per-connection subscription sets onto the shared
//!   dispatcher and owns their cleanup on disconnect.
//! - [`PvStreamServer`] accepts connections and runs one task per client.

pub mod fanout;
pub mod server;

pub use fanout::{ConnectionId, FanoutManager};
pub use server::{PvStreamServer, ServerConfig};

pub use pvstream_core::{Dispatcher, PvUpdate};
