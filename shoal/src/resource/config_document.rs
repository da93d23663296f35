use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ObjectMeta, Resource};

/// Per-campaign document the dispatcher reads at worker start.
///
/// `batches[i]` is the batch document for worker index `i`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub base_config: Map<String, Value>,
    #[serde(default)]
    pub batches: Vec<Value>,
}

impl Resource for ConfigDocument {
    const KIND: &'static str = "ConfigDocument";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
