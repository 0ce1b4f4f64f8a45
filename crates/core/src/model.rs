//! Encoder model hosting adapters: lifecycle operations, active
//! composition state, and training-mode variable selection.

use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder, VarMap};
use tracing::{debug, info};

use crate::composition::Composition;
use crate::config::{AdapterConfig, AdapterConfigs, FusionConfig, ModelConfig};
use crate::error::ComposeError;
use crate::block::EncoderLayer;
use crate::layer::AdapterLayer;

/// Word + learned position embeddings with a final layer norm.
struct Embeddings {
    word: Embedding,
    position: Embedding,
    norm: LayerNorm,
}

impl Embeddings {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let word = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word"))?;
        let position = embedding(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position"),
        )?;
        let norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            word,
            position,
            norm,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let words = self.word.forward(input_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let positions = self.position.forward(&position_ids)?;
        self.norm.forward(&words.broadcast_add(&positions)?)
    }
}

/// A frozen encoder backbone that hosts named adapter modules and
/// interprets the active composition on every forward pass.
///
/// The active composition and the per-block registries are plain mutable
/// state on this struct; configuration changes must be serialized with
/// respect to forward passes by the caller. Concurrent forward passes over
/// an unchanging model are fine.
pub struct EncoderModel {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    configs: AdapterConfigs,
    active: Option<Composition>,
    config: ModelConfig,
    device: Device,
    dtype: DType,
}

impl EncoderModel {
    /// Build the backbone. Adapters are added afterwards with
    /// [`EncoderModel::add_adapter`], passing the same root `VarBuilder`.
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> std::result::Result<Self, ComposeError> {
        let embeddings = Embeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_layers = vb.pp("encoder").pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::new(cfg, vb_layers.pp(i))?);
        }
        Ok(Self {
            embeddings,
            layers,
            configs: AdapterConfigs::new(),
            active: None,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn adapter_configs(&self) -> &AdapterConfigs {
        &self.configs
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Register a new adapter and create its modules in every layer not
    /// named by the configuration's `leave_out`.
    ///
    /// `vb` must be the root `VarBuilder` the model was built from so the
    /// new variables land under the model's paths.
    pub fn add_adapter(
        &mut self,
        name: &str,
        config: AdapterConfig,
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        if self.configs.contains(name) {
            return Err(ComposeError::DuplicateAdapter(name.to_string()));
        }
        info!(adapter = name, "adding adapter");
        let leave_out = config.leave_out.clone();
        self.configs.add(name, config);

        let vb_layers = vb.pp("encoder").pp("layers");
        for (i, layer) in self.layers.iter_mut().enumerate() {
            if leave_out.contains(&i) {
                continue;
            }
            layer.add_adapter(name, &self.configs, vb_layers.pp(i))?;
        }
        Ok(())
    }

    /// Create a fusion module for the named adapter group in every layer
    /// and at every site where the group's placement flags agree. Installs
    /// the default fusion configuration if none is set.
    pub fn add_fusion_layer(
        &mut self,
        names: &[String],
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        if self.configs.fusion().is_none() {
            self.configs.set_fusion(FusionConfig::default());
        }
        info!(group = names.join(","), "adding fusion layer");

        let vb_layers = vb.pp("encoder").pp("layers");
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.add_fusion_layer(names, &self.configs, vb_layers.pp(i))?;
        }
        Ok(())
    }

    /// Set (or clear) the composition interpreted by subsequent forward
    /// passes.
    pub fn set_active_composition(&mut self, setup: Option<Composition>) {
        match &setup {
            Some(setup) => debug!(adapters = ?setup.flatten(), "activating composition"),
            None => debug!("deactivating composition"),
        }
        self.active = setup;
    }

    pub fn active_composition(&self) -> Option<&Composition> {
        self.active.as_ref()
    }

    /// Select the trainable variables for the setup's adapters and make
    /// the setup active. The returned variables feed an optimizer; all
    /// other parameters stay untouched, which keeps the backbone frozen.
    pub fn train_adapter(&mut self, setup: Composition, varmap: &VarMap) -> Vec<Var> {
        let prefixes: Vec<String> = setup
            .flatten()
            .iter()
            .map(|name| format!(".adapters.{name}."))
            .collect();
        let vars = vars_matching(varmap, &prefixes);
        info!(count = vars.len(), "selected adapter variables for training");
        self.set_active_composition(Some(setup));
        vars
    }

    /// Select the trainable variables for the setup's fusion groups and
    /// make the setup active.
    pub fn train_fusion(&mut self, setup: Composition, varmap: &VarMap) -> Vec<Var> {
        let prefixes: Vec<String> = setup
            .fusion_groups()
            .iter()
            .map(|group| format!(".adapter_fusion.{group}."))
            .collect();
        let vars = vars_matching(varmap, &prefixes);
        info!(count = vars.len(), "selected fusion variables for training");
        self.set_active_composition(Some(setup));
        vars
    }

    /// Sum of the value-weight regularization terms of every fusion
    /// module in the model. Exactly zero when no fusion module exists.
    pub fn fusion_regularization_loss(&self) -> Result<Tensor> {
        let mut loss = Tensor::zeros((), self.dtype, &self.device)?;
        for layer in &self.layers {
            for site in [layer.attention_adapters(), layer.output_adapters()] {
                for fusion in site.fusion_modules() {
                    if let Some(term) = fusion.regularization_loss()? {
                        loss = (loss + term)?;
                    }
                }
            }
        }
        Ok(loss)
    }

    /// Encode token ids into hidden states, routing every block through
    /// the active composition.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> std::result::Result<Tensor, ComposeError> {
        let mut hidden_states = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            hidden_states =
                layer.forward(&hidden_states, attention_mask, self.active.as_ref(), &self.configs)?;
        }
        Ok(hidden_states)
    }

    /// Run a single block's adapter site on explicit tensors. Mostly
    /// useful for probing composition behavior.
    pub fn site_forward(
        &self,
        site: &AdapterLayer,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
    ) -> std::result::Result<Tensor, ComposeError> {
        site.adapters_forward(hidden_states, input_tensor, self.active.as_ref(), &self.configs)
    }
}

fn vars_matching(varmap: &VarMap, prefixes: &[String]) -> Vec<Var> {
    let data = varmap.data().lock().unwrap();
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| prefixes.iter().any(|p| name.contains(p.as_str())))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    // deterministic ordering for optimizers and tests
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars.into_iter().map(|(_, var)| var).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            hidden_size: 32,
            num_attention_heads: 2,
            num_hidden_layers: 3,
            intermediate_size: 64,
            vocab_size: 128,
            max_position_embeddings: 64,
            hidden_act: "gelu".to_string(),
            layer_norm_eps: 1e-12,
            extra: serde_json::Map::new(),
        }
    }

    fn tiny_model() -> (EncoderModel, VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = EncoderModel::new(&tiny_config(), vb.clone()).unwrap();
        (model, varmap, vb)
    }

    fn input_ids(seq: usize) -> Tensor {
        let ids: Vec<u32> = (0..seq as u32).collect();
        Tensor::from_vec(ids, (1, seq), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let (model, _varmap, _vb) = tiny_model();
        let output = model.forward(&input_ids(6), None).unwrap();
        assert_eq!(output.dims(), &[1, 6, 32]);
    }

    #[test]
    fn test_add_adapter_rejects_duplicates() {
        let (mut model, _varmap, vb) = tiny_model();
        model
            .add_adapter("task", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        let err = model
            .add_adapter("task", AdapterConfig::pfeiffer(), vb)
            .unwrap_err();
        assert!(matches!(err, ComposeError::DuplicateAdapter(_)));
    }

    #[test]
    fn test_leave_out_excludes_layers() {
        let (mut model, _varmap, vb) = tiny_model();
        let mut config = AdapterConfig::pfeiffer();
        config.leave_out = vec![1];
        model.add_adapter("task", config, vb).unwrap();

        assert!(model.layers()[0].output_adapters().has_adapter("task"));
        assert!(!model.layers()[1].output_adapters().has_adapter("task"));
        assert!(model.layers()[2].output_adapters().has_adapter("task"));
    }

    #[test]
    fn test_active_composition_round_trip() {
        let (mut model, _varmap, vb) = tiny_model();
        model
            .add_adapter("task", AdapterConfig::pfeiffer(), vb)
            .unwrap();
        assert!(model.active_composition().is_none());

        model.set_active_composition(Some(Composition::leaf("task")));
        assert_eq!(
            model.active_composition().unwrap().flatten(),
            vec!["task"]
        );

        model.set_active_composition(None);
        assert!(model.active_composition().is_none());
    }

    #[test]
    fn test_inactive_composition_is_pass_through() {
        let (mut model, _varmap, vb) = tiny_model();
        model
            .add_adapter("task", AdapterConfig::pfeiffer(), vb)
            .unwrap();

        let ids = input_ids(5);
        let baseline = model.forward(&ids, None).unwrap();

        // activating a composition of unknown names must not change anything
        model.set_active_composition(Some(Composition::stack_of(["ghost"])));
        let ghosted = model.forward(&ids, None).unwrap();

        let diff = (&baseline - &ghosted)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < f32::EPSILON, "unhosted compositions must pass through");
    }

    #[test]
    fn test_train_adapter_selects_only_named_vars() {
        let (mut model, varmap, vb) = tiny_model();
        let total_before = varmap.all_vars().len();
        model
            .add_adapter("a", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        model
            .add_adapter("b", AdapterConfig::pfeiffer(), vb)
            .unwrap();

        let vars_a = model.train_adapter(Composition::leaf("a"), &varmap);
        // pfeiffer: one site per layer, down + up weight and bias
        assert_eq!(vars_a.len(), 3 * 4);
        assert!(model.active_composition().is_some());

        let vars_ab = model.train_adapter(Composition::stack_of(["a", "b"]), &varmap);
        assert_eq!(vars_ab.len(), 2 * 3 * 4);

        // backbone vars are never selected
        assert!(varmap.all_vars().len() > total_before);
        assert!(vars_ab.len() < varmap.all_vars().len());
    }

    #[test]
    fn test_train_fusion_selects_fusion_vars() {
        let (mut model, varmap, vb) = tiny_model();
        model
            .add_adapter("a", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        model
            .add_adapter("b", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        model.add_fusion_layer(&names, vb).unwrap();

        let setup = Composition::fuse_of(["a", "b"]);
        let vars = model.train_fusion(setup, &varmap);
        // output site only (pfeiffer), per layer: query w+b, key w+b, value w
        assert_eq!(vars.len(), 3 * 5);
    }

    #[test]
    fn test_fusion_regularization_zero_without_fusion() {
        let (model, _varmap, _vb) = tiny_model();
        let loss = model.fusion_regularization_loss().unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_fusion_regularization_counts_modules() {
        let (mut model, _varmap, vb) = tiny_model();
        model
            .add_adapter("a", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        model
            .add_adapter("b", AdapterConfig::pfeiffer(), vb.clone())
            .unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        model.add_fusion_layer(&names, vb).unwrap();

        // randomly initialized value weights are not the identity
        let loss = model.fusion_regularization_loss().unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
    }
}
