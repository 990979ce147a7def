//! # pvstream-sources
//!
//! Value sources feeding the pvstream dispatcher.
//!
//! - [`SimulatedSource`]: synthesizes beamline signals and motor motion
//! - [`LiveSource`]: bridges a threaded [`ProtocolClient`] into the dispatcher
//! - [`LineGatewayClient`]: newline-delimited JSON protocol client over TCP
//!
//! [`start_source`] picks the variant from [`Settings`] and falls back to the
//! simulated source when the live client cannot be brought up.

pub mod gateway;
pub mod live;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use pvstream_core::{Dispatcher, PvError, Settings, SourceMode};
use serde_json::Value;
use tracing::{error, info};

pub use gateway::LineGatewayClient;
pub use live::{LiveSource, MonitorSink, ProtocolClient};
pub use simulated::{default_catalog, SimPv, SimSettings, SimulatedSource};

/// A producer of timestamped values for named variables.
///
/// Every value a source produces is handed to its [`Dispatcher`].
#[async_trait]
pub trait ValueSource: Send + Sync {
    /// Which variant this is.
    fn mode(&self) -> SourceMode;

    /// Begin producing values.
    async fn start(&self) -> Result<(), PvError>;

    /// Cancel all production tasks and release the underlying client.
    async fn stop(&self);

    /// Write a value to a variable.
    ///
    /// A failed write changes nothing and produces no update.
    async fn put(&self, name: &str, value: Value) -> Result<(), PvError>;

    /// Last value known for a variable.
    fn current_value(&self, name: &str) -> Option<Value>;
}

/// Build and start the source selected by `settings`.
///
/// Live mode that fails to connect or start is logged and replaced by the
/// simulated source for the rest of the process lifetime.
pub async fn start_source(settings: &Settings, dispatcher: Arc<Dispatcher>) -> Arc<dyn ValueSource> {
    if settings.mode == SourceMode::Live {
        match start_live(settings, dispatcher.clone()).await {
            Ok(source) => return source,
            Err(e) => {
                error!(
                    addr = %settings.live_addr,
                    error = %e,
                    "Live source unavailable, falling back to simulated mode"
                );
            }
        }
    }

    let source = Arc::new(SimulatedSource::new(dispatcher, SimSettings::from(settings)));
    if let Err(e) = source.start().await {
        error!(error = %e, "Failed to start simulated source");
    }
    source
}

async fn start_live(
    settings: &Settings,
    dispatcher: Arc<Dispatcher>,
) -> Result<Arc<dyn ValueSource>, PvError> {
    let addr = settings.live_addr.clone();
    let timeout = settings.put_timeout();

    let client = tokio::task::spawn_blocking(move || LineGatewayClient::connect(&addr, timeout))
        .await
        .map_err(|e| PvError::SourceUnavailable(e.to_string()))??;
    info!(addr = %settings.live_addr, "Connected to live gateway");

    let source = Arc::new(LiveSource::new(Arc::new(client), dispatcher, settings));
    source.start().await?;
    Ok(source)
}
