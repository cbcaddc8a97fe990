//! Schema transformer
//!
//! Consumes config change notifications and derives the routing state
//! implied by high-level objects: auto-assigned route targets for routing
//! instances, policy connectivity between virtual networks and BGP peering.
//! Every derived state is written back to the config store and reported as
//! a UVE.

pub mod config;
pub mod error;
pub mod resources;
pub mod uve;

pub use config::{DaemonConfig, TransformerConfig, DEFAULT_CONFIG_PATH};
pub use error::{Result, SchemaTransformerError};
pub use resources::{register_resources, RouteTargetAllocator, TransformerContext};
pub use uve::{CollectingUvePublisher, TracingUvePublisher, Uve, UvePublisher};

use vnc_sync_common::{SyncEngine, SyncEngineBuilder};

/// Builds the transformer's engine from configuration.
pub fn build_engine(config: &DaemonConfig, cx: &TransformerContext) -> Result<SyncEngine> {
    let engine = register_resources(SyncEngineBuilder::new(), cx)
        .with_options(config.sync.tracker_options())
        .build()?;
    Ok(engine)
}
