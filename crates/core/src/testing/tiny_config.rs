use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::model::EncoderModel;

/// Create a tiny encoder config for testing (2 layers, 32 hidden, 2 heads).
/// Uses < 1MB of parameters.
pub fn tiny_encoder_config() -> ModelConfig {
    ModelConfig {
        hidden_size: 32,
        num_attention_heads: 2,
        num_hidden_layers: 2,
        intermediate_size: 64,
        vocab_size: 128,
        max_position_embeddings: 64,
        hidden_act: "gelu".to_string(),
        layer_norm_eps: 1e-12,
        extra: serde_json::Map::new(),
    }
}

/// A tiny CPU model together with the variable store backing it. The
/// `VarBuilder` is a clone of the one the model was built from, for use
/// with the `add_adapter` / `add_fusion_layer` lifecycle operations.
pub struct TinyModel {
    pub model: EncoderModel,
    pub varmap: VarMap,
    pub vb: VarBuilder<'static>,
}

/// Build a tiny CPU model with no adapters.
pub fn tiny_model() -> TinyModel {
    tiny_model_on(&tiny_encoder_config())
}

/// Build a tiny CPU model from a custom config.
pub fn tiny_model_on(config: &ModelConfig) -> TinyModel {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = EncoderModel::new(config, vb.clone()).expect("tiny model construction");
    TinyModel { model, varmap, vb }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_encoder_config_is_valid() {
        let config = tiny_encoder_config();
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.num_attention_heads, 2);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.num_hidden_layers, 2);
    }

    #[test]
    fn tiny_model_builds() {
        let tiny = tiny_model();
        assert_eq!(tiny.model.layers().len(), 2);
        assert!(!tiny.varmap.all_vars().is_empty());
    }
}
