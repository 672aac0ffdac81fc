//! Property bindings: how a parent's property value is projected onto a
//! child's mutable property.

use std::collections::HashMap;
use std::sync::Arc;

use crate::meta::Meta;
use crate::naming::Name;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum PropertyBinding {
    /// Writes `value` to `target` once, at child attach.
    Const { target: Name, value: Meta },
    /// Subscribes to `source` on the parent and writes `target` on the child
    /// on every update.
    Source { source: Name, target: Name },
    /// Like `Source`, but applies a registered transformer before writing.
    Transformed { source: Name, target: Name, transformer_id: String, meta: Meta },
}

impl PropertyBinding {
    pub fn target(&self) -> &Name {
        match self {
            PropertyBinding::Const { target, .. } => target,
            PropertyBinding::Source { target, .. } => target,
            PropertyBinding::Transformed { target, .. } => target,
        }
    }

    pub fn source(&self) -> Option<&Name> {
        match self {
            PropertyBinding::Const { .. } => None,
            PropertyBinding::Source { source, .. } => Some(source),
            PropertyBinding::Transformed { source, .. } => Some(source),
        }
    }
}

/// A named transformation applied by a `Transformed` binding, e.g. linear
/// `a*x + b` or `toString`.
pub trait Transformer: Send + Sync {
    fn apply(&self, input: &Meta, params: &Meta) -> Meta;
}

struct LinearTransformer;

impl Transformer for LinearTransformer {
    fn apply(&self, input: &Meta, params: &Meta) -> Meta {
        let a = params.get("a").and_then(Meta::as_f64).unwrap_or(1.0);
        let b = params.get("b").and_then(Meta::as_f64).unwrap_or(0.0);
        match input.as_f64() {
            Some(x) => Meta::leaf(a * x + b),
            None => input.clone(),
        }
    }
}

struct ToStringTransformer;

impl Transformer for ToStringTransformer {
    fn apply(&self, input: &Meta, _params: &Meta) -> Meta {
        match &input.leaf {
            Some(leaf) => Meta::leaf(format!("{}", Meta { leaf: Some(leaf.clone()), children: Default::default() })),
            None => input.clone(),
        }
    }
}

/// Registry of transformer implementations keyed by id, consulted by
/// `Transformed` bindings at propagation time.
#[derive(Clone)]
pub struct TransformerRegistry {
    transformers: Arc<HashMap<String, Arc<dyn Transformer>>>,
}

impl TransformerRegistry {
    /// A registry preloaded with the built-in `linear` and `toString` transformers.
    pub fn with_builtins() -> Self {
        let mut map: HashMap<String, Arc<dyn Transformer>> = HashMap::new();
        map.insert("linear".to_string(), Arc::new(LinearTransformer));
        map.insert("toString".to_string(), Arc::new(ToStringTransformer));
        Self { transformers: Arc::new(map) }
    }

    pub fn empty() -> Self {
        Self { transformers: Arc::new(HashMap::new()) }
    }

    pub fn register(mut self, id: impl Into<String>, transformer: Arc<dyn Transformer>) -> Self {
        Arc::make_mut(&mut self.transformers).insert(id.into(), transformer);
        self
    }

    pub fn apply(&self, transformer_id: &str, input: &Meta, params: &Meta) -> Option<Meta> {
        self.transformers.get(transformer_id).map(|t| t.apply(input, params))
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
