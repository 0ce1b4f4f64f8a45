//! Per-block adapter site: registries, residual/layer-norm resolution,
//! and the recursive composition interpreter.
//!
//! Every encoder block has two of these (one after the attention output
//! projection, one after the feed-forward output projection). Each owns
//! its adapter and fusion modules together with the block's layer norm,
//! and exposes a single entry point, [`AdapterLayer::adapters_forward`],
//! that either interprets the active composition tree or falls through to
//! the plain residual + layer-norm path.

use std::collections::HashMap;

use candle_core::{Module, Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};
use tracing::debug;

use crate::adapter::Adapter;
use crate::composition::Composition;
use crate::config::{AdapterConfig, AdapterConfigs, AdapterLocation, FusionConfig};
use crate::error::ComposeError;
use crate::fusion::AdapterFusion;

/// Tensors resolved from one adapter's configuration before it runs:
/// the (possibly normalized) hidden state entering the adapter, the
/// fusion query if fusion is configured, and the residual added back
/// after adapter processing.
pub struct PreParams {
    pub hidden_states: Tensor,
    pub query: Option<Tensor>,
    pub residual: Tensor,
}

/// One adapter site of an encoder block.
pub struct AdapterLayer {
    location: AdapterLocation,
    layer_norm: LayerNorm,
    hidden_size: usize,
    layer_norm_eps: f64,
    adapters: HashMap<String, Adapter>,
    fusion_layers: HashMap<String, AdapterFusion>,
}

impl AdapterLayer {
    /// Create an empty site. `vb` is the site's own variable scope; the
    /// block's layer norm lives under `layer_norm`, adapters under
    /// `adapters.<name>`, fusion modules under `adapter_fusion.<group>`.
    pub fn new(
        hidden_size: usize,
        layer_norm_eps: f64,
        location: AdapterLocation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layer_norm = layer_norm(hidden_size, layer_norm_eps, vb.pp("layer_norm"))?;
        Ok(Self {
            location,
            layer_norm,
            hidden_size,
            layer_norm_eps,
            adapters: HashMap::new(),
            fusion_layers: HashMap::new(),
        })
    }

    pub fn location(&self) -> AdapterLocation {
        self.location
    }

    pub fn layer_norm(&self) -> &LayerNorm {
        &self.layer_norm
    }

    /// Whether this site hosts the named adapter.
    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn has_fusion_layer(&self, group: &str) -> bool {
        self.fusion_layers.contains_key(group)
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    pub(crate) fn fusion_modules(&self) -> impl Iterator<Item = &AdapterFusion> {
        self.fusion_layers.values()
    }

    /// Create an adapter module for `name` if its configuration places an
    /// adapter at this site; otherwise a no-op.
    pub fn add_adapter(
        &mut self,
        name: &str,
        configs: &AdapterConfigs,
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        let Some(config) = configs.get(name) else {
            return Ok(());
        };
        if !config.placed_at(self.location) {
            return Ok(());
        }
        let adapter = Adapter::new(
            self.hidden_size,
            config,
            self.layer_norm_eps,
            vb.pp("adapters").pp(name),
        )?;
        self.adapters.insert(name.to_string(), adapter);
        Ok(())
    }

    /// Create a fusion module for the group if every named adapter agrees
    /// it is placed at this site; otherwise a no-op.
    pub fn add_fusion_layer(
        &mut self,
        names: &[String],
        configs: &AdapterConfigs,
        vb: VarBuilder,
    ) -> std::result::Result<(), ComposeError> {
        if configs.common_location_value(names, self.location) != Some(true) {
            return Ok(());
        }
        let fusion_config = configs.fusion().ok_or(ComposeError::MissingFusionConfig)?;
        let group = names.join(",");
        let fusion = AdapterFusion::new(
            self.hidden_size,
            fusion_config,
            vb.pp("adapter_fusion").pp(&group),
        )?;
        self.fusion_layers.insert(group, fusion);
        Ok(())
    }

    /// Resolve the adapter input, fusion query, and residual for one
    /// adapter configuration.
    ///
    /// The capture order is load-bearing: when `residual_before_ln` and
    /// `original_ln_before` are both set, the residual is the hidden state
    /// strictly before the layer norm while the adapter input is the
    /// normalized value.
    pub fn preparams(
        &self,
        config: &AdapterConfig,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        fusion_config: Option<&FusionConfig>,
    ) -> Result<PreParams> {
        let mut query = None;

        let residual_before = config
            .residual_before_ln
            .then(|| hidden_states.clone());

        if let Some(fusion) = fusion_config {
            if fusion.query_before_ln {
                query = Some(hidden_states.clone());
            }
        }

        let hidden_states = if config.original_ln_before {
            self.layer_norm
                .forward(&(hidden_states + input_tensor)?)?
        } else {
            hidden_states.clone()
        };

        let residual = match residual_before {
            Some(residual) => residual,
            None => hidden_states.clone(),
        };

        if let Some(fusion) = fusion_config {
            if !fusion.query_before_ln {
                query = Some(hidden_states.clone());
            }
        }

        Ok(PreParams {
            hidden_states,
            query,
            residual,
        })
    }

    /// Sequentially apply a stack's children. Returns the final hidden
    /// state and the up-projection of the last entry that ran.
    fn compose_stack(
        &self,
        children: &[Composition],
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        level: usize,
        configs: &AdapterConfigs,
    ) -> std::result::Result<(Tensor, Option<Tensor>), ComposeError> {
        let mut hidden_states = hidden_states.clone();
        let mut up = None;

        for child in children {
            if child.is_composite() && level >= 1 {
                return Err(ComposeError::TooDeep {
                    kind: child.kind(),
                    level,
                });
            }
            match child {
                Composition::Fuse { name, children } => {
                    hidden_states =
                        self.compose_fuse(name, children, &hidden_states, input_tensor, level, configs)?;
                    up = Some(hidden_states.clone());
                }
                Composition::Split {
                    children,
                    split_index,
                } => {
                    hidden_states = self.compose_split(
                        children,
                        *split_index,
                        &hidden_states,
                        input_tensor,
                        level,
                        configs,
                    )?;
                    up = Some(hidden_states.clone());
                }
                Composition::Leaf(name) => {
                    // adapters absent from this block pass through
                    if let Some(adapter) = self.adapters.get(name) {
                        let config = configs
                            .get(name)
                            .ok_or_else(|| ComposeError::MissingAdapterConfig(name.clone()))?;
                        let pre = self.preparams(
                            config,
                            &hidden_states,
                            input_tensor,
                            configs.fusion(),
                        )?;
                        let (output, adapter_up) =
                            adapter.forward(&pre.hidden_states, &pre.residual)?;
                        hidden_states = output;
                        up = Some(adapter_up);
                    }
                }
                Composition::Stack(_) => {
                    return Err(ComposeError::InvalidNesting {
                        child: "Stack",
                        parent: "Stack",
                    });
                }
            }
        }
        Ok((hidden_states, up))
    }

    /// Run all fusion children on the same input and combine their
    /// up-projections through the group's fusion module. The last child's
    /// adapter configuration governs residual and layer-norm placement.
    fn compose_fuse(
        &self,
        group: &str,
        children: &[Composition],
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        level: usize,
        configs: &AdapterConfigs,
    ) -> std::result::Result<Tensor, ComposeError> {
        let last = children
            .iter()
            .rev()
            .find_map(|c| c.last_adapter())
            .ok_or_else(|| ComposeError::UnknownFusionGroup(group.to_string()))?;
        let config = configs
            .get(last)
            .ok_or_else(|| ComposeError::MissingAdapterConfig(last.to_string()))?;
        let pre = self.preparams(config, hidden_states, input_tensor, configs.fusion())?;

        let mut up_list = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Composition::Stack(grandchildren) => {
                    let (_, up) = self.compose_stack(
                        grandchildren,
                        &pre.hidden_states,
                        input_tensor,
                        level + 1,
                        configs,
                    )?;
                    if let Some(up) = up {
                        up_list.push(up);
                    }
                }
                Composition::Leaf(name) => {
                    if let Some(adapter) = self.adapters.get(name) {
                        let (_, up) = adapter.forward(&pre.hidden_states, &pre.residual)?;
                        up_list.push(up);
                    }
                }
                other => {
                    return Err(ComposeError::InvalidNesting {
                        child: other.kind(),
                        parent: "Fuse",
                    });
                }
            }
        }

        // no fused adapter is hosted here: nothing to attend over
        if up_list.is_empty() {
            return Ok(pre.hidden_states);
        }

        // [b, s, h] each -> [b, s, n, h] with the adapter axis between
        // batch and feature axes
        let stacked = Tensor::stack(&up_list, 2)?;
        let fusion = self
            .fusion_layers
            .get(group)
            .ok_or_else(|| ComposeError::UnknownFusionGroup(group.to_string()))?;
        let query = pre.query.ok_or(ComposeError::MissingFusionConfig)?;
        let fused = fusion.forward(&query, &stacked, &stacked, &pre.residual)?;
        Ok(fused)
    }

    /// Partition the sequence dimension at `split_index` and run each
    /// child on its own segment. The first child's adapter configuration
    /// governs residual and layer-norm placement.
    fn compose_split(
        &self,
        children: &[Composition; 2],
        split_index: usize,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        level: usize,
        configs: &AdapterConfigs,
    ) -> std::result::Result<Tensor, ComposeError> {
        let first = children[0]
            .first_adapter()
            .or_else(|| children[1].first_adapter())
            .ok_or_else(|| {
                ComposeError::UnknownComposition("split names no adapters".to_string())
            })?;
        let config = configs
            .get(first)
            .ok_or_else(|| ComposeError::MissingAdapterConfig(first.to_string()))?;
        let pre = self.preparams(config, hidden_states, input_tensor, configs.fusion())?;

        let seq_len = pre.hidden_states.dim(1)?;
        if split_index == 0 || split_index >= seq_len {
            return Err(ComposeError::SplitOutOfRange {
                split_index,
                seq_len,
            });
        }

        let segments = |t: &Tensor| -> Result<[Tensor; 2]> {
            Ok([
                t.narrow(1, 0, split_index)?,
                t.narrow(1, split_index, seq_len - split_index)?,
            ])
        };
        let hidden_segments = segments(&pre.hidden_states)?;
        let input_segments = segments(input_tensor)?;
        let residual_segments = segments(&pre.residual)?;

        let mut outputs = Vec::with_capacity(2);
        for (i, child) in children.iter().enumerate() {
            let output = match child {
                Composition::Stack(grandchildren) => {
                    self.compose_stack(
                        grandchildren,
                        &hidden_segments[i],
                        &input_segments[i],
                        level + 1,
                        configs,
                    )?
                    .0
                }
                Composition::Leaf(name) => match self.adapters.get(name) {
                    Some(adapter) => {
                        adapter
                            .forward(&hidden_segments[i], &residual_segments[i])?
                            .0
                    }
                    None => hidden_segments[i].clone(),
                },
                other => {
                    return Err(ComposeError::InvalidNesting {
                        child: other.kind(),
                        parent: "Split",
                    });
                }
            };
            outputs.push(output);
        }

        let joined = Tensor::cat(&[&outputs[0], &outputs[1]], 1)?;
        Ok(joined)
    }

    /// Block entry point, called once per forward pass per site.
    ///
    /// When a composition is active and at least one of its flattened
    /// adapter names is hosted here, the tree is interpreted and the last
    /// adapter's configuration decides whether the block's residual +
    /// layer norm still runs afterwards. Otherwise this is exactly
    /// `LayerNorm(hidden_states + input_tensor)`.
    pub fn adapters_forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        active: Option<&Composition>,
        configs: &AdapterConfigs,
    ) -> std::result::Result<Tensor, ComposeError> {
        if let Some(setup) = active {
            let hosts_any = setup
                .flatten()
                .iter()
                .any(|name| self.adapters.contains_key(*name));
            if hosts_any {
                debug!(setup = setup.kind(), "interpreting active composition");
                let mut hidden = match setup {
                    Composition::Stack(children) => {
                        self.compose_stack(children, hidden_states, input_tensor, 0, configs)?
                            .0
                    }
                    Composition::Fuse { name, children } => {
                        self.compose_fuse(name, children, hidden_states, input_tensor, 0, configs)?
                    }
                    Composition::Split {
                        children,
                        split_index,
                    } => self.compose_split(
                        children,
                        *split_index,
                        hidden_states,
                        input_tensor,
                        0,
                        configs,
                    )?,
                    // a bare adapter name is a one-element stack
                    Composition::Leaf(_) => {
                        self.compose_stack(
                            std::slice::from_ref(setup),
                            hidden_states,
                            input_tensor,
                            0,
                            configs,
                        )?
                        .0
                    }
                };

                if let Some(last) = setup.last_adapter() {
                    let last_config = configs
                        .get(last)
                        .ok_or_else(|| ComposeError::MissingAdapterConfig(last.to_string()))?;
                    if last_config.original_ln_after {
                        hidden = self.layer_norm.forward(&(hidden + input_tensor)?)?;
                    }
                }
                return Ok(hidden);
            }
        }

        let output = self.layer_norm.forward(&(hidden_states + input_tensor)?)?;
        Ok(output)
    }
}
