//! # pvstream-web
//!
//! REST API for the PV acquisition subsystem.
//!
//! This crate provides:
//! - Windowed, downsampled history queries for plot widgets
//! - One-off reads and writes of single variables outside the live stream
//! - The list of known variables
//! - Server statistics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pvstream_web::{create_router, ServerState};
//!
//! let state = Arc::new(ServerState::new(dispatcher, source, fanout));
//! let app = create_router(state);
//!
//! let listener = TcpListener::bind("0.0.0.0:3001").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod routes;
pub mod statistics;

// Re-exports
pub use routes::create_router;
pub use statistics::{ServerStatistics, StatisticsCollector};

use std::sync::Arc;

use pvstream_core::Dispatcher;
use pvstream_server::FanoutManager;
use pvstream_sources::ValueSource;

/// Shared server state for all route handlers.
pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
    pub source: Arc<dyn ValueSource>,
    pub fanout: Arc<FanoutManager>,
    pub stats: StatisticsCollector,
}

impl ServerState {
    /// Create new server state.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        source: Arc<dyn ValueSource>,
        fanout: Arc<FanoutManager>,
    ) -> Self {
        Self {
            dispatcher,
            source,
            fanout,
            stats: StatisticsCollector::new(),
        }
    }

    /// Current statistics snapshot.
    pub fn statistics(&self) -> ServerStatistics {
        self.stats.snapshot(&self.dispatcher, &self.fanout)
    }
}

/// Type alias for shared state in Axum handlers.
pub type AppState = Arc<ServerState>;
