//! Prediction heads on top of the encoder: a named registry with an
//! active head and dispatch by name.

use std::collections::HashMap;

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Activation, Linear, VarBuilder};
use thiserror::Error;
use tracing::info;

use crate::composition::Composition;
use crate::error::ComposeError;
use crate::model::EncoderModel;

/// Errors from prediction-head dispatch.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("no prediction head given and no active head set")]
    MissingHead,
    #[error("unknown prediction head: {0}")]
    UnknownHead(String),
    #[error("prediction head already exists: {0}")]
    HeadExists(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Sequence classification: pool the first token, project to labels.
pub struct ClassificationHead {
    dense: Linear,
    out_proj: Linear,
    activation: Activation,
}

impl ClassificationHead {
    pub fn new(hidden_size: usize, num_labels: usize, vb: VarBuilder) -> Result<Self> {
        let dense = linear(hidden_size, hidden_size, vb.pp("dense"))?;
        let out_proj = linear(hidden_size, num_labels, vb.pp("out_proj"))?;
        Ok(Self {
            dense,
            out_proj,
            activation: Activation::Gelu,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        // first-token pooling
        let pooled = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.activation.forward(&self.dense.forward(&pooled)?)?;
        self.out_proj.forward(&pooled)
    }
}

/// Token classification: per-position projection to labels.
pub struct TaggingHead {
    out_proj: Linear,
}

impl TaggingHead {
    pub fn new(hidden_size: usize, num_labels: usize, vb: VarBuilder) -> Result<Self> {
        let out_proj = linear(hidden_size, num_labels, vb.pp("out_proj"))?;
        Ok(Self { out_proj })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.out_proj.forward(hidden_states)
    }
}

/// A registered prediction head.
pub enum PredictionHead {
    Classification(ClassificationHead),
    Tagging(TaggingHead),
}

impl PredictionHead {
    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        match self {
            Self::Classification(head) => head.forward(hidden_states),
            Self::Tagging(head) => head.forward(hidden_states),
        }
    }
}

/// Encoder model plus named prediction heads.
pub struct EncoderModelWithHeads {
    model: EncoderModel,
    heads: HashMap<String, PredictionHead>,
    active_head: Option<String>,
}

impl EncoderModelWithHeads {
    pub fn new(model: EncoderModel) -> Self {
        Self {
            model,
            heads: HashMap::new(),
            active_head: None,
        }
    }

    pub fn model(&self) -> &EncoderModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut EncoderModel {
        &mut self.model
    }

    pub fn head_names(&self) -> Vec<&str> {
        self.heads.keys().map(|s| s.as_str()).collect()
    }

    pub fn active_head(&self) -> Option<&str> {
        self.active_head.as_deref()
    }

    pub fn set_active_head(&mut self, name: Option<String>) {
        self.active_head = name;
    }

    /// Register a head under a name. The new head becomes active.
    pub fn add_head(
        &mut self,
        name: impl Into<String>,
        head: PredictionHead,
        overwrite: bool,
    ) -> std::result::Result<(), HeadError> {
        let name = name.into();
        if self.heads.contains_key(&name) && !overwrite {
            return Err(HeadError::HeadExists(name));
        }
        info!(head = name.as_str(), "adding prediction head");
        self.heads.insert(name.clone(), head);
        self.active_head = Some(name);
        Ok(())
    }

    pub fn add_classification_head(
        &mut self,
        name: impl Into<String>,
        num_labels: usize,
        vb: VarBuilder,
    ) -> std::result::Result<(), HeadError> {
        let name = name.into();
        let head = ClassificationHead::new(
            self.model.config().hidden_size,
            num_labels,
            vb.pp("heads").pp(&name),
        )?;
        self.add_head(name, PredictionHead::Classification(head), false)
    }

    pub fn add_tagging_head(
        &mut self,
        name: impl Into<String>,
        num_labels: usize,
        vb: VarBuilder,
    ) -> std::result::Result<(), HeadError> {
        let name = name.into();
        let head = TaggingHead::new(
            self.model.config().hidden_size,
            num_labels,
            vb.pp("heads").pp(&name),
        )?;
        self.add_head(name, PredictionHead::Tagging(head), false)
    }

    /// Activate a composition and, when a head shares the name of its
    /// last adapter, that head too.
    pub fn set_active_composition(&mut self, setup: Option<Composition>) {
        if let Some(setup) = &setup {
            match setup.last_adapter() {
                Some(last) if self.heads.contains_key(last) => {
                    self.active_head = Some(last.to_string());
                }
                Some(last) => {
                    info!(head = last, "no prediction head with this name");
                }
                None => {}
            }
        }
        self.model.set_active_composition(setup);
    }

    /// Run the named head (or the active head) on encoder output.
    pub fn forward_head(
        &self,
        hidden_states: &Tensor,
        name: Option<&str>,
    ) -> std::result::Result<Tensor, HeadError> {
        let name = match name.or(self.active_head.as_deref()) {
            Some(name) => name,
            None => return Err(HeadError::MissingHead),
        };
        let head = self
            .heads
            .get(name)
            .ok_or_else(|| HeadError::UnknownHead(name.to_string()))?;
        let logits = head.forward(hidden_states)?;
        Ok(logits)
    }

    /// Encode and dispatch to a head in one step.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        head: Option<&str>,
    ) -> std::result::Result<Tensor, ModelWithHeadsError> {
        let hidden_states = self.model.forward(input_ids, attention_mask)?;
        let logits = self.forward_head(&hidden_states, head)?;
        Ok(logits)
    }
}

/// Combined error for the encode-and-classify path.
#[derive(Debug, Error)]
pub enum ModelWithHeadsError {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Head(#[from] HeadError),
}
