//! Bottleneck adapter module: down projection, non-linearity, up
//! projection, with optional internal layer norms.

use candle_core::{Module, Result, Tensor};
use candle_nn::{layer_norm, linear, Activation, LayerNorm, Linear, VarBuilder};

use crate::config::AdapterConfig;
use crate::error::ComposeError;

/// Map a configuration string to a candle activation.
pub fn activation_from_name(name: &str) -> std::result::Result<Activation, ComposeError> {
    match name {
        "relu" => Ok(Activation::Relu),
        "gelu" => Ok(Activation::Gelu),
        "gelu_new" => Ok(Activation::NewGelu),
        "swish" | "silu" => Ok(Activation::Silu),
        other => Err(ComposeError::UnknownActivation(other.to_string())),
    }
}

/// A single trainable adapter inserted into a frozen backbone block.
///
/// The forward computation is:
/// ```text
/// up = up_proj(act(down_proj(maybe_norm(x))))
/// output = maybe_norm(up + residual)
/// ```
/// with the residual added before or after the post-norm according to the
/// adapter configuration. The raw `up` tensor is returned alongside the
/// output because fusion attends over it.
#[derive(Debug)]
pub struct Adapter {
    down_proj: Linear,
    up_proj: Linear,
    norm_before: Option<LayerNorm>,
    norm_after: Option<LayerNorm>,
    activation: Activation,
    residual_before_norm: bool,
}

impl Adapter {
    pub fn new(
        hidden_size: usize,
        config: &AdapterConfig,
        layer_norm_eps: f64,
        vb: VarBuilder,
    ) -> std::result::Result<Self, ComposeError> {
        let down_size = (hidden_size / config.reduction_factor).max(1);
        let activation = activation_from_name(&config.non_linearity)?;

        let norm_before = if config.ln_before {
            Some(layer_norm(hidden_size, layer_norm_eps, vb.pp("norm_before"))?)
        } else {
            None
        };
        let norm_after = if config.ln_after {
            Some(layer_norm(hidden_size, layer_norm_eps, vb.pp("norm_after"))?)
        } else {
            None
        };
        let down_proj = linear(hidden_size, down_size, vb.pp("down"))?;
        let up_proj = linear(down_size, hidden_size, vb.pp("up"))?;

        Ok(Self {
            down_proj,
            up_proj,
            norm_before,
            norm_after,
            activation,
            residual_before_norm: config.adapter_residual_before_ln,
        })
    }

    pub fn down_size(&self) -> usize {
        self.down_proj.weight().dims()[0]
    }

    /// Run the adapter. Returns `(output, up)` where `output` includes the
    /// residual and `up` is the raw up-projection.
    pub fn forward(&self, hidden_states: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let x = match &self.norm_before {
            Some(norm) => norm.forward(hidden_states)?,
            None => hidden_states.clone(),
        };
        let down = self.activation.forward(&self.down_proj.forward(&x)?)?;
        let up = self.up_proj.forward(&down)?;

        let mut output = up.clone();
        if self.residual_before_norm {
            output = (output + residual)?;
        }
        if let Some(norm) = &self.norm_after {
            output = norm.forward(&output)?;
        }
        if !self.residual_before_norm {
            output = (output + residual)?;
        }
        Ok((output, up))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn test_adapter(hidden: usize, config: &AdapterConfig) -> Adapter {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Adapter::new(hidden, config, 1e-12, vb).unwrap()
    }

    #[test]
    fn test_adapter_preserves_shape() {
        let adapter = test_adapter(32, &AdapterConfig::pfeiffer());
        let device = Device::Cpu;
        let hidden = Tensor::randn(0.0f32, 1.0, (2, 6, 32), &device).unwrap();
        let residual = Tensor::randn(0.0f32, 1.0, (2, 6, 32), &device).unwrap();

        let (output, up) = adapter.forward(&hidden, &residual).unwrap();
        assert_eq!(output.dims(), &[2, 6, 32]);
        assert_eq!(up.dims(), &[2, 6, 32]);
    }

    #[test]
    fn test_adapter_bottleneck_size() {
        let mut config = AdapterConfig::pfeiffer();
        config.reduction_factor = 8;
        let adapter = test_adapter(32, &config);
        assert_eq!(adapter.down_size(), 4);

        // reduction larger than hidden size clamps to 1
        config.reduction_factor = 64;
        let adapter = test_adapter(32, &config);
        assert_eq!(adapter.down_size(), 1);
    }

    #[test]
    fn test_adapter_adds_residual() {
        // zero projections make the up branch zero, so the output must
        // equal the residual exactly
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let adapter = Adapter::new(16, &AdapterConfig::pfeiffer(), 1e-12, vb).unwrap();
        let device = Device::Cpu;
        let hidden = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device).unwrap();
        let residual = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device).unwrap();

        let (output, _) = adapter.forward(&hidden, &residual).unwrap();
        let diff = (&output - &residual)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < f32::EPSILON);
    }

    #[test]
    fn test_unknown_activation_is_rejected() {
        let mut config = AdapterConfig::pfeiffer();
        config.non_linearity = "softsign".to_string();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = Adapter::new(16, &config, 1e-12, vb).unwrap_err();
        assert!(matches!(err, ComposeError::UnknownActivation(_)));
    }
}
