//! Error types for adapter composition.

use thiserror::Error;

/// Errors raised while building or interpreting adapter compositions.
///
/// All variants are fatal for the forward pass they occur in; nothing is
/// retried. The one deliberate non-error is an adapter name that is absent
/// from a block's registry, which passes through unchanged.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A composite node was found below the supported nesting depth.
    #[error("composition is too deep: cannot have {kind} at level {level}")]
    TooDeep { kind: &'static str, level: usize },

    /// A composite node appeared in a position where it is not allowed.
    #[error("invalid composition: cannot nest {child} in {parent}")]
    InvalidNesting {
        child: &'static str,
        parent: &'static str,
    },

    /// A declarative composition value did not match any known form.
    #[error("unknown composition form: {0}")]
    UnknownComposition(String),

    /// A Fuse node referenced a fusion group with no module at this block.
    #[error("no fusion layer registered for group '{0}'")]
    UnknownFusionGroup(String),

    /// Fusion was requested but no fusion configuration is registered.
    #[error("no fusion configuration registered")]
    MissingFusionConfig,

    /// An adapter module exists but its configuration entry is gone.
    #[error("no configuration registered for adapter '{0}'")]
    MissingAdapterConfig(String),

    /// An adapter name was registered twice.
    #[error("adapter name already registered: {0}")]
    DuplicateAdapter(String),

    /// A Split node's index does not fall inside the sequence.
    #[error("split index {split_index} out of range for sequence length {seq_len}")]
    SplitOutOfRange { split_index: usize, seq_len: usize },

    /// An adapter configuration named a non-linearity we cannot map.
    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
