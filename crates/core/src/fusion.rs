//! Attention-based fusion of several adapters' up-projections.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};

use crate::config::FusionConfig;

/// Coefficient for the value-weight regularization term.
const REGULARIZATION_SCALE: f64 = 0.01;

/// Attention over the adapter axis of stacked up-projections.
///
/// `query` is the block's hidden state (`[batch, seq, hidden]`); `key` and
/// `value` are the stacked up-projections (`[batch, seq, n, hidden]`).
/// For every (batch, seq) position the module computes a softmax
/// distribution over the `n` adapters, takes the weighted sum of their
/// values, and adds the residual.
#[derive(Debug)]
pub struct AdapterFusion {
    query_proj: Option<Linear>,
    key_proj: Option<Linear>,
    value_proj: Option<Linear>,
    regularization: bool,
}

impl AdapterFusion {
    pub fn new(hidden_size: usize, config: &FusionConfig, vb: VarBuilder) -> Result<Self> {
        let query_proj = if config.query {
            Some(linear(hidden_size, hidden_size, vb.pp("query"))?)
        } else {
            None
        };
        let key_proj = if config.key {
            Some(linear(hidden_size, hidden_size, vb.pp("key"))?)
        } else {
            None
        };
        let value_proj = if config.value {
            Some(linear_no_bias(hidden_size, hidden_size, vb.pp("value"))?)
        } else {
            None
        };
        Ok(Self {
            query_proj,
            key_proj,
            value_proj,
            regularization: config.regularization,
        })
    }

    /// Build from pre-constructed projections.
    pub fn from_parts(
        query_proj: Option<Linear>,
        key_proj: Option<Linear>,
        value_proj: Option<Linear>,
        regularization: bool,
    ) -> Self {
        Self {
            query_proj,
            key_proj,
            value_proj,
            regularization,
        }
    }

    /// Fuse the stacked up-projections into one hidden state.
    ///
    /// Shapes: `query` `[b, s, h]`, `key`/`value` `[b, s, n, h]`,
    /// `residual` `[b, s, h]`; the output matches `residual`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        residual: &Tensor,
    ) -> Result<Tensor> {
        let q = match &self.query_proj {
            Some(proj) => proj.forward(query)?,
            None => query.clone(),
        };
        let k = match &self.key_proj {
            Some(proj) => proj.forward(key)?,
            None => key.clone(),
        };
        let v = match &self.value_proj {
            Some(proj) => proj.forward(value)?,
            None => value.clone(),
        };

        // [b, s, 1, h] x [b, s, h, n] -> [b, s, n] attention over adapters
        let scores = q
            .unsqueeze(2)?
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .squeeze(2)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        // [b, s, 1, n] x [b, s, n, h] -> [b, s, h] weighted adapter sum
        let context = probs.unsqueeze(2)?.matmul(&v.contiguous()?)?.squeeze(2)?;
        context + residual
    }

    /// Squared Frobenius distance of the value weight from the identity,
    /// scaled by the regularization coefficient. None when this module has
    /// no value projection or regularization is disabled for it.
    pub fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let Some(value_proj) = &self.value_proj else {
            return Ok(None);
        };
        if !self.regularization {
            return Ok(None);
        }
        let weight = value_proj.weight();
        let n = weight.dims()[0];
        let target = identity_matrix(n, weight.dtype(), weight.device())?;
        let loss = ((target - weight)?.sqr()?.sum_all()? * REGULARIZATION_SCALE)?;
        Ok(Some(loss))
    }
}

/// Dense identity matrix.
pub(crate) fn identity_matrix(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}
