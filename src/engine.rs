//! Wiring of configuration, ledger, destination and transports

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::ledger::{FjallLedger, Ledger};
use crate::observability::Metrics;
use crate::queue::{EngineHandle, ManagerSettings, Result};
use crate::storage::{Destination, LocalDestination, ObjectStoreDestination};
use crate::transport::{
    DirectStreamTransport, EventStreamTransport, HttpClient, JobServer, MethodSelector,
    TransportSet,
};

/// Start an engine from configuration alone
///
/// Must be called inside a tokio runtime.
pub fn start(config: &Config) -> Result<EngineHandle> {
    config.validate()?;
    let ledger: Arc<dyn Ledger> = Arc::new(FjallLedger::open(&config.storage.ledger_path)?);
    let destination = destination(config)?;
    start_with(config, ledger, destination)
}

/// Start an engine with an explicit ledger and destination
pub fn start_with(
    config: &Config,
    ledger: Arc<dyn Ledger>,
    destination: Arc<dyn Destination>,
) -> Result<EngineHandle> {
    let server: Arc<dyn JobServer> = Arc::new(HttpClient::new(&config.server)?);
    start_with_server(config, ledger, destination, server)
}

fn start_with_server(
    config: &Config,
    ledger: Arc<dyn Ledger>,
    destination: Arc<dyn Destination>,
    server: Arc<dyn JobServer>,
) -> Result<EngineHandle> {
    let event_stream = EventStreamTransport::new(
        Arc::clone(&server),
        Arc::clone(&destination),
        config.session.clone(),
    );
    let direct_stream = DirectStreamTransport::new(
        server,
        Arc::clone(&destination),
        config.storage.staging_dir.clone(),
    );

    info!(
        server = %config.server.base_url,
        destination = %destination.describe(),
        transport = %config.transport.default,
        "Starting download engine"
    );

    Ok(EngineHandle::spawn(ManagerSettings {
        selector: MethodSelector::from_config(&config.transport),
        transports: TransportSet::new(Arc::new(event_stream), Arc::new(direct_stream)),
        ledger,
        metrics: Arc::new(Metrics::new()),
        persist_debounce: config.queue.persist_debounce(),
        force_next: config.transport.force_next,
    }))
}

/// Output directory as configured: plain directory or sandboxed object store
pub fn destination(config: &Config) -> Result<Arc<dyn Destination>> {
    let storage = &config.storage;
    if storage.sandboxed {
        let sandbox =
            ObjectStoreDestination::local(&storage.output_dir, storage.copy_block_size.as_usize())?;
        Ok(Arc::new(sandbox))
    } else {
        Ok(Arc::new(LocalDestination::new(storage.output_dir.clone())))
    }
}
