//! Model, adapter, and fusion configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Backbone configuration for an encoder model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    pub layer_norm_eps: f64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            intermediate_size: 3072,
            vocab_size: 30522,
            max_position_embeddings: 512,
            hidden_act: "gelu".to_string(),
            layer_norm_eps: 1e-12,
            extra: serde_json::Map::new(),
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// The two adapter sites inside an encoder block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterLocation {
    /// After the multi-head attention output projection.
    MultiHead,
    /// After the feed-forward output projection.
    Output,
}

/// Configuration of a single named adapter. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Bottleneck ratio: the down projection maps to
    /// `hidden_size / reduction_factor`.
    pub reduction_factor: usize,
    /// Non-linearity between the down and up projections.
    pub non_linearity: String,
    /// Layer norm inside the adapter, before the down projection.
    #[serde(default)]
    pub ln_before: bool,
    /// Layer norm inside the adapter, after the up projection.
    #[serde(default)]
    pub ln_after: bool,
    /// Whether the adapter adds its residual input before its own
    /// post-norm (when `ln_after` is set) or after.
    #[serde(default = "default_true")]
    pub adapter_residual_before_ln: bool,
    /// Whether the block-level residual branch is captured before the
    /// block's layer norm.
    #[serde(default = "default_true")]
    pub residual_before_ln: bool,
    /// Whether the block applies its residual + layer norm before adapter
    /// processing.
    #[serde(default = "default_true")]
    pub original_ln_before: bool,
    /// Whether the block applies its residual + layer norm after adapter
    /// processing.
    #[serde(default = "default_true")]
    pub original_ln_after: bool,
    /// Place an adapter module at the attention output site.
    #[serde(default)]
    pub mh_adapter: bool,
    /// Place an adapter module at the feed-forward output site.
    #[serde(default = "default_true")]
    pub output_adapter: bool,
    /// Layer indices excluded from hosting this adapter.
    #[serde(default)]
    pub leave_out: Vec<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::pfeiffer()
    }
}

impl AdapterConfig {
    /// Single-site bottleneck adapter at the feed-forward output, relu
    /// non-linearity, reduction 16.
    pub fn pfeiffer() -> Self {
        Self {
            reduction_factor: 16,
            non_linearity: "relu".to_string(),
            ln_before: false,
            ln_after: false,
            adapter_residual_before_ln: true,
            residual_before_ln: true,
            original_ln_before: true,
            original_ln_after: true,
            mh_adapter: false,
            output_adapter: true,
            leave_out: Vec::new(),
        }
    }

    /// Two-site bottleneck adapter (attention and feed-forward outputs),
    /// swish non-linearity, reduction 16.
    pub fn houlsby() -> Self {
        Self {
            reduction_factor: 16,
            non_linearity: "swish".to_string(),
            ln_before: false,
            ln_after: false,
            adapter_residual_before_ln: true,
            residual_before_ln: true,
            original_ln_before: false,
            original_ln_after: true,
            mh_adapter: true,
            output_adapter: true,
            leave_out: Vec::new(),
        }
    }

    /// Whether this adapter places a module at the given site.
    pub fn placed_at(&self, location: AdapterLocation) -> bool {
        match location {
            AdapterLocation::MultiHead => self.mh_adapter,
            AdapterLocation::Output => self.output_adapter,
        }
    }
}

/// Configuration shared by all fusion modules of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Project the query input.
    #[serde(default = "default_true")]
    pub query: bool,
    /// Project the stacked keys.
    #[serde(default = "default_true")]
    pub key: bool,
    /// Project the stacked values (unbiased projection).
    #[serde(default = "default_true")]
    pub value: bool,
    /// Capture the fusion query before the block's layer norm.
    #[serde(default = "default_true")]
    pub query_before_ln: bool,
    /// Include the value projections in the regularization aggregate.
    #[serde(default = "default_true")]
    pub regularization: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            query: true,
            key: true,
            value: true,
            query_before_ln: true,
            regularization: true,
        }
    }
}

/// Registry of adapter configurations plus the model-wide fusion
/// configuration. Blocks consult this when creating modules and on every
/// composed forward pass.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfigs {
    adapters: HashMap<String, AdapterConfig>,
    fusion: Option<FusionConfig>,
}

impl AdapterConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configuration under an adapter name. Overwrites any
    /// previous entry; callers guard against duplicates.
    pub fn add(&mut self, name: impl Into<String>, config: AdapterConfig) {
        self.adapters.insert(name.into(), config);
    }

    pub fn get(&self, name: &str) -> Option<&AdapterConfig> {
        self.adapters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(|s| s.as_str())
    }

    /// The placement flag shared by all named adapters at a site, or None
    /// if any adapter is unknown or the adapters disagree. Fusion modules
    /// are only created at sites where this returns `Some(true)`.
    pub fn common_location_value(
        &self,
        names: &[String],
        location: AdapterLocation,
    ) -> Option<bool> {
        let mut common = None;
        for name in names {
            let placed = self.get(name)?.placed_at(location);
            match common {
                None => common = Some(placed),
                Some(prev) if prev != placed => return None,
                Some(_) => {}
            }
        }
        common
    }

    pub fn fusion(&self) -> Option<&FusionConfig> {
        self.fusion.as_ref()
    }

    pub fn set_fusion(&mut self, config: FusionConfig) {
        self.fusion = Some(config);
    }
}
