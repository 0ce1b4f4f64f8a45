//! Composition trees describing how named adapters combine at runtime.
//!
//! A composition is an immutable tree: a bare adapter name (leaf), a
//! sequential stack, a parallel fusion, or a positional split of the
//! sequence dimension. The tree only names adapters; the modules
//! themselves live in per-block registries and are resolved at forward
//! time, so the same tree can be active while some blocks host only a
//! subset of the referenced adapters.

use serde_json::Value;

use crate::error::ComposeError;

/// A node in an adapter composition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Composition {
    /// A single adapter, identified by name.
    Leaf(String),
    /// Sequential application; each child consumes the previous output.
    Stack(Vec<Composition>),
    /// Parallel application; all children consume the same input and
    /// their up-projections are combined by the fusion module registered
    /// under `name`.
    Fuse {
        /// Fusion group key: comma-joined adapter names, order-sensitive.
        name: String,
        children: Vec<Composition>,
    },
    /// Positional partition of the sequence dimension: the first child
    /// processes tokens `[0, split_index)`, the second `[split_index, ..)`.
    Split {
        children: Box<[Composition; 2]>,
        split_index: usize,
    },
}

impl Composition {
    /// Create a leaf node for a single adapter.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self::Leaf(name.into())
    }

    /// Create a stack from an ordered sequence of children.
    pub fn stack(children: impl IntoIterator<Item = Composition>) -> Self {
        Self::Stack(children.into_iter().collect())
    }

    /// Convenience: a stack of plain adapter names.
    pub fn stack_of<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self::Stack(names.into_iter().map(Self::leaf).collect())
    }

    /// Create a fusion node. The group key is derived from the children:
    /// the comma-joined sequence of each child's last adapter name. The
    /// same derivation keys the per-block fusion registries, so a fusion
    /// module added for `["a", "b"]` is found by `Fuse` over those names.
    pub fn fuse(children: impl IntoIterator<Item = Composition>) -> Self {
        let children: Vec<Composition> = children.into_iter().collect();
        let name = children
            .iter()
            .filter_map(|c| c.last_adapter())
            .collect::<Vec<_>>()
            .join(",");
        Self::Fuse { name, children }
    }

    /// Convenience: a fusion of plain adapter names.
    pub fn fuse_of<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self::fuse(names.into_iter().map(Self::leaf))
    }

    /// Create a split node over exactly two children.
    pub fn split(first: Composition, second: Composition, split_index: usize) -> Self {
        Self::Split {
            children: Box::new([first, second]),
            split_index,
        }
    }

    /// Short kind name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "Leaf",
            Self::Stack(_) => "Stack",
            Self::Fuse { .. } => "Fuse",
            Self::Split { .. } => "Split",
        }
    }

    /// Whether this node is a composite (anything but a leaf).
    pub fn is_composite(&self) -> bool {
        !matches!(self, Self::Leaf(_))
    }

    /// All adapter names referenced anywhere in the tree, in first-seen
    /// order, deduplicated.
    pub fn flatten(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Leaf(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Self::Stack(children) | Self::Fuse { children, .. } => {
                for child in children {
                    child.collect_names(out);
                }
            }
            Self::Split { children, .. } => {
                for child in children.iter() {
                    child.collect_names(out);
                }
            }
        }
    }

    /// The leftmost adapter name in the tree, if any.
    pub fn first_adapter(&self) -> Option<&str> {
        match self {
            Self::Leaf(name) => Some(name),
            Self::Stack(children) | Self::Fuse { children, .. } => {
                children.iter().find_map(|c| c.first_adapter())
            }
            Self::Split { children, .. } => children.iter().find_map(|c| c.first_adapter()),
        }
    }

    /// The rightmost adapter name in the tree, if any.
    pub fn last_adapter(&self) -> Option<&str> {
        match self {
            Self::Leaf(name) => Some(name),
            Self::Stack(children) | Self::Fuse { children, .. } => {
                children.iter().rev().find_map(|c| c.last_adapter())
            }
            Self::Split { children, .. } => children.iter().rev().find_map(|c| c.last_adapter()),
        }
    }

    /// Fusion group keys referenced by this tree (the node itself plus
    /// fusion nodes nested one level down).
    pub fn fusion_groups(&self) -> Vec<&str> {
        let mut groups = Vec::new();
        if let Self::Fuse { name, .. } = self {
            groups.push(name.as_str());
        }
        let children: &[Composition] = match self {
            Self::Stack(children) | Self::Fuse { children, .. } => children,
            Self::Split { children, .. } => children.as_ref(),
            Self::Leaf(_) => &[],
        };
        for child in children {
            if let Self::Fuse { name, .. } = child {
                if !groups.contains(&name.as_str()) {
                    groups.push(name);
                }
            }
        }
        groups
    }

    /// Parse a composition from its declarative JSON form.
    ///
    /// Accepted shapes:
    /// - `"name"`: a leaf
    /// - `["a", {...}]`: a stack of nested forms
    /// - `{"stack": [...]}`: an explicit stack
    /// - `{"fuse": [...]}`: a fusion
    /// - `{"split": {"children": [.., ..], "split_index": k}}`: a split
    pub fn from_value(value: &Value) -> Result<Self, ComposeError> {
        match value {
            Value::String(name) => Ok(Self::leaf(name.clone())),
            Value::Array(items) => {
                let children = items
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Stack(children))
            }
            Value::Object(map) => {
                if let Some(items) = map.get("stack").and_then(Value::as_array) {
                    let children = items
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Self::Stack(children));
                }
                if let Some(items) = map.get("fuse").and_then(Value::as_array) {
                    let children = items
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Self::fuse(children));
                }
                if let Some(split) = map.get("split").and_then(Value::as_object) {
                    let children = split
                        .get("children")
                        .and_then(Value::as_array)
                        .filter(|items| items.len() == 2)
                        .ok_or_else(|| {
                            ComposeError::UnknownComposition(
                                "split requires exactly two children".to_string(),
                            )
                        })?;
                    let split_index = split
                        .get("split_index")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| {
                            ComposeError::UnknownComposition(
                                "split requires a numeric split_index".to_string(),
                            )
                        })?;
                    let first = Self::from_value(&children[0])?;
                    let second = Self::from_value(&children[1])?;
                    return Ok(Self::split(first, second, split_index as usize));
                }
                Err(ComposeError::UnknownComposition(value.to_string()))
            }
            other => Err(ComposeError::UnknownComposition(other.to_string())),
        }
    }
}
