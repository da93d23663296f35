//! Worker-side configuration dispatch.
//!
//! A worker receives the base configuration, the campaign's ordered batch
//! documents and its own index. [`merge`] picks the batch at that index and
//! overlays its top-level keys onto the base. The overlay is shallow: arrays
//! and nested objects in the batch replace the base value wholesale.
//!
//! JSON objects keep their keys sorted, so identical inputs always serialize
//! to identical bytes.

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::partition::Batch;

/// Path of the base configuration document.
pub const ENV_BASE_CONFIG: &str = "SHOAL_BASE_CONFIG";
/// Path of the batch list document.
pub const ENV_BATCHES: &str = "SHOAL_BATCHES";
/// The worker's batch index.
pub const ENV_WORKER_INDEX: &str = "SHOAL_WORKER_INDEX";
/// Index variable set by indexed-job substrates; read when
/// [`ENV_WORKER_INDEX`] is absent.
pub const ENV_COMPLETION_INDEX: &str = "JOB_COMPLETION_INDEX";
/// Where to write the merged configuration.
pub const ENV_MERGED_CONFIG: &str = "SHOAL_MERGED_CONFIG";
/// Where to write the selected batch document.
pub const ENV_BATCH_CONFIG: &str = "SHOAL_BATCH_CONFIG";
/// Name of the configuration document, set on executions.
pub const ENV_CONFIG_DOCUMENT: &str = "SHOAL_CONFIG_DOCUMENT";

/// Key holding the repository list inside a batch document.
pub const REPOSITORIES_KEY: &str = "repositories";

/// Result of a dispatch: the merged configuration and the selected batch.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOutput {
    pub merged: Value,
    pub batch: Value,
}

/// Overlays `batches[worker_index]` onto `base`.
///
/// # Errors
///
/// [`Error::WorkerIndexOutOfBounds`] when the index addresses no batch, and
/// [`Error::InvalidDocument`] when either side is not a JSON object. Both are
/// fatal.
pub fn merge(base: &Value, batches: &[Value], worker_index: usize) -> Result<DispatchOutput> {
    let _span = crate::telemetry::dispatch_span(worker_index).entered();

    let batch = batches
        .get(worker_index)
        .ok_or(Error::WorkerIndexOutOfBounds {
            index: worker_index,
            len: batches.len(),
        })?;

    let Value::Object(base_fields) = base else {
        return Err(Error::invalid_document("base configuration must be a JSON object"));
    };
    let Value::Object(batch_fields) = batch else {
        return Err(Error::invalid_document(format!(
            "batch {worker_index} must be a JSON object"
        )));
    };

    let mut merged: Map<String, Value> = base_fields.clone();
    for (key, value) in batch_fields {
        merged.insert(key.clone(), value.clone());
    }

    tracing::debug!(
        worker_index,
        overridden = batch_fields.keys().filter(|k| base_fields.contains_key(*k)).count(),
        "configuration merged"
    );

    Ok(DispatchOutput {
        merged: Value::Object(merged),
        batch: batch.clone(),
    })
}

/// Parses both documents and runs [`merge`].
///
/// The batch list may be a bare array or an object with a `batches` array
/// (the stored configuration document shape).
pub fn merge_documents(base: &str, batches: &str, worker_index: usize) -> Result<DispatchOutput> {
    let base: Value = serde_json::from_str(base)?;
    let batches = parse_batches(serde_json::from_str(batches)?)?;
    merge(&base, &batches, worker_index)
}

/// Extracts the ordered batch list from a batch-list document.
pub fn parse_batches(document: Value) -> Result<Vec<Value>> {
    match document {
        Value::Array(batches) => Ok(batches),
        Value::Object(mut fields) => match fields.remove("batches") {
            Some(Value::Array(batches)) => Ok(batches),
            _ => Err(Error::invalid_document("expected a `batches` array")),
        },
        _ => Err(Error::invalid_document(
            "batch list must be an array or an object with `batches`",
        )),
    }
}

/// The batch document handed to one worker.
pub fn batch_document(repositories: &[String]) -> Value {
    json!({ REPOSITORIES_KEY: repositories })
}

/// Batch documents for a whole partition, in index order.
pub fn batch_documents(batches: &[Batch]) -> Vec<Value> {
    batches.iter().map(|b| batch_document(b)).collect()
}

/// Serializes a document the way the dispatcher writes it.
pub fn render(document: &Value) -> Result<String> {
    let mut out = serde_json::to_string_pretty(document)?;
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keys_override_base() {
        let base = json!({"a": 1, "b": 2});
        let out = merge(&base, &[json!({"b": 3})], 0).unwrap();
        assert_eq!(out.merged, json!({"a": 1, "b": 3}));
        assert_eq!(out.batch, json!({"b": 3}));
    }

    #[test]
    fn nested_values_replace_wholesale() {
        let base = json!({"opts": {"x": 1, "y": 2}, "list": [1, 2, 3]});
        let batch = json!({"opts": {"z": 9}, "list": []});
        let out = merge(&base, &[batch], 0).unwrap();
        assert_eq!(out.merged, json!({"opts": {"z": 9}, "list": []}));
    }

    #[test]
    fn disjoint_keys_union() {
        let base = json!({"platform": "github", "dryRun": true});
        let batches = batch_documents(&[vec!["org/a".into()], vec!["org/b".into(), "org/c".into()]]);
        let out = merge(&base, &batches, 1).unwrap();
        assert_eq!(
            out.merged,
            json!({"platform": "github", "dryRun": true, "repositories": ["org/b", "org/c"]})
        );
    }

    #[test]
    fn index_past_end_is_fatal() {
        let batches = vec![json!({}), json!({})];
        let err = merge(&json!({}), &batches, 2).unwrap_err();
        assert!(matches!(err, Error::WorkerIndexOutOfBounds { index: 2, len: 2 }));
        assert!(err.is_fatal());

        assert!(merge(&json!({}), &[], 0).is_err());
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(merge(&json!([1]), &[json!({})], 0).unwrap_err().is_fatal());
        assert!(merge(&json!({}), &[json!("x")], 0).unwrap_err().is_fatal());
    }

    #[test]
    fn output_is_byte_identical_across_calls() {
        let base = r#"{"z": 1, "a": {"k": [3, 2, 1]}, "m": null}"#;
        let batches = r#"{"batches": [{"repositories": ["r1"]}, {"q": true, "a": 0}]}"#;
        let first = render(&merge_documents(base, batches, 1).unwrap().merged).unwrap();
        let second = render(&merge_documents(base, batches, 1).unwrap().merged).unwrap();
        assert_eq!(first, second);
        assert!(first.find("\"a\"").unwrap() < first.find("\"z\"").unwrap());
    }

    #[test]
    fn parse_batches_accepts_both_shapes() {
        assert_eq!(parse_batches(json!([{"a": 1}])).unwrap().len(), 1);
        assert_eq!(parse_batches(json!({"batches": []})).unwrap().len(), 0);
        assert!(parse_batches(json!({"other": []})).is_err());
        assert!(parse_batches(json!(3)).is_err());
    }

    #[test]
    fn malformed_json_is_fatal() {
        let err = merge_documents("{", "[]", 0).unwrap_err();
        assert!(err.is_fatal());
    }
}
