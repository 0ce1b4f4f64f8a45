//! Encoder block: bidirectional self-attention and feed-forward sublayers
//! with an adapter site after each output projection.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Activation, Linear, VarBuilder};

use crate::adapter::activation_from_name;
use crate::composition::Composition;
use crate::config::{AdapterConfigs, AdapterLocation, ModelConfig};
use crate::error::ComposeError;
use crate::layer::AdapterLayer;

/// Multi-head bidirectional self-attention (pre output-projection).
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let head_dim = cfg.head_dim();
        let q_proj = linear(cfg.hidden_size, num_heads * head_dim, vb.pp("query"))?;
        let k_proj = linear(cfg.hidden_size, num_heads * head_dim, vb.pp("key"))?;
        let v_proj = linear(cfg.hidden_size, num_heads * head_dim, vb.pp("value"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            num_heads,
            head_dim,
        })
    }

    /// `attention_mask` is additive and broadcastable to
    /// `[batch, heads, seq, seq]`.
    fn forward(&self, xs: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = match attention_mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let context = attn_weights.matmul(&v.contiguous()?)?;

        context
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))
    }
}

/// Output projection of a sublayer followed by its adapter site.
struct SublayerOutput {
    dense: Linear,
    adapters: AdapterLayer,
}

impl SublayerOutput {
    fn new(
        cfg: &ModelConfig,
        input_size: usize,
        location: AdapterLocation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dense = linear(input_size, cfg.hidden_size, vb.pp("dense"))?;
        let adapters = AdapterLayer::new(cfg.hidden_size, cfg.layer_norm_eps, location, vb)?;
        Ok(Self { dense, adapters })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        active: Option<&Composition>,
        configs: &AdapterConfigs,
    ) -> std::result::Result<Tensor, ComposeError> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.adapters
            .adapters_forward(&hidden_states, input_tensor, active, configs)
    }
}

/// One encoder block with its two adapter sites.
pub struct EncoderLayer {
    attention: SelfAttention,
    attention_output: SublayerOutput,
    intermediate: Linear,
    intermediate_act: Activation,
    ffn_output: SublayerOutput,
}

impl EncoderLayer {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> std::result::Result<Self, ComposeError> {
        let attention = SelfAttention::new(cfg, vb.pp("attention"))?;
        let attention_output = SublayerOutput::new(
            cfg,
            cfg.hidden_size,
            AdapterLocation::MultiHead,
            vb.pp("attention_output"),
        )?;
        let intermediate = linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("intermediate"))?;
        let intermediate_act = activation_from_name(&cfg.hidden_act)?;
        let ffn_output = SublayerOutput::new(
            cfg,
            cfg.intermediate_size,
            AdapterLocation::Output,
            vb.pp("ffn_output"),
        )?;
        Ok(Self {
            attention,
            attention_output,
            intermediate,
            intermediate_act,
            ffn_output,
        })
    }

    /// The adapter site after the attention output projection.
    pub fn attention_adapters(&self) -> &AdapterLayer {
        &self.attention_output.adapters
    }

    /// The adapter site after the feed-forward output projection.
    pub fn output_adapters(&self) -> &AdapterLayer {
        &self.ffn_output.adapters
    }

    /// Create the named adapter at every site its configuration enables.
    pub fn add_adapter(
        &mut self,
        name: &str,
        configs: &AdapterConfigs,
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        self.attention_output
            .adapters
            .add_adapter(name, configs, vb.pp("attention_output"))?;
        self.ffn_output
            .adapters
            .add_adapter(name, configs, vb.pp("ffn_output"))?;
        Ok(())
    }

    /// Create the fusion group at every site where its adapters agree.
    pub fn add_fusion_layer(
        &mut self,
        names: &[String],
        configs: &AdapterConfigs,
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        self.attention_output
            .adapters
            .add_fusion_layer(names, configs, vb.pp("attention_output"))?;
        self.ffn_output
            .adapters
            .add_fusion_layer(names, configs, vb.pp("ffn_output"))?;
        Ok(())
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        active: Option<&Composition>,
        configs: &AdapterConfigs,
    ) -> std::result::Result<Tensor, ComposeError> {
        let attn = self.attention.forward(hidden_states, attention_mask)?;
        let attn_output =
            self.attention_output
                .forward(&attn, hidden_states, active, configs)?;

        let intermediate = self
            .intermediate_act
            .forward(&self.intermediate.forward(&attn_output)?)?;
        self.ffn_output
            .forward(&intermediate, &attn_output, active, configs)
    }
}
