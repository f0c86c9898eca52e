//! Wiring for the meshcore console: configuration, pipeline assembly and
//! the command handlers behind the binary.

pub mod commands;
pub mod config;
pub mod doctor;

use meshcore_observe::UiEventStore;
use meshcore_radio::{
    AdapterKind, HardwareAdapter, MeshcoreService, MockSession, RadioAdapter, ServiceError,
};
use meshcore_store::{Store, StoreError};
use thiserror::Error;

pub use config::{load_config, Config, ConfigError};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("cannot send to {0:?}")]
    InvalidTarget(String),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Opens the configured database and applies migrations.
pub fn open_store(config: &Config) -> Result<Store, ConsoleError> {
    let store = Store::open(&config.database.path, config.db_settings())?;
    tracing::debug!(path = %config.database.path, "database ready");
    Ok(store)
}

/// The adapter named by `radio.mode`. Nothing past this point knows which
/// one it got.
pub fn build_adapter(config: &Config) -> Result<Box<dyn RadioAdapter>, ConsoleError> {
    Ok(match config.radio.mode {
        AdapterKind::Mock => Box::new(MockSession::new(config.mock_settings())),
        AdapterKind::Hardware => Box::new(HardwareAdapter::new(config.hardware_settings()?)),
    })
}

/// Store, adapter, service and event store, assembled but not connected.
pub fn build_pipeline(config: &Config) -> Result<UiEventStore, ConsoleError> {
    let store = open_store(config)?;
    let adapter = build_adapter(config)?;
    tracing::info!(
        mode = %config.radio.mode,
        node_name = %config.radio.node_name,
        "pipeline assembled"
    );
    let service = MeshcoreService::new(adapter, store, config.service_settings());
    Ok(UiEventStore::new(service, config.pipeline_settings()))
}
