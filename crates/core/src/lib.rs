//! Composable bottleneck adapters for candle transformer backbones.
//!
//! A frozen encoder hosts many small, independently trainable adapter
//! modules. A declarative composition tree of sequential stacking, parallel
//! attention fusion, and positional splitting decides per forward pass
//! how the hosted adapters transform each block's hidden state.

pub mod adapter;
pub mod block;
pub mod composition;
pub mod config;
pub mod error;
pub mod fusion;
pub mod heads;
pub mod layer;
pub mod logging;
pub mod model;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::Adapter;
pub use block::EncoderLayer;
pub use composition::Composition;
pub use config::{AdapterConfig, AdapterConfigs, AdapterLocation, FusionConfig, ModelConfig};
pub use error::ComposeError;
pub use fusion::AdapterFusion;
pub use heads::{EncoderModelWithHeads, HeadError, PredictionHead};
pub use layer::{AdapterLayer, PreParams};
pub use model::EncoderModel;
