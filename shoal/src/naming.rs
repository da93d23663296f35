//! Deterministic names that fit the object store's length ceiling.

/// Hard length ceiling for generated names, suffix included.
pub const MAX_NAME_LEN: usize = 63;

/// Suffix of the per-campaign configuration document.
pub const CONFIG_DOCUMENT_SUFFIX: &str = "-batches";

/// Suffix that marks a work unit's batch index.
pub fn batch_suffix(batch_index: usize) -> String {
    format!("-batch-{batch_index}")
}

/// Name of the work unit (and its execution) for a campaign batch.
pub fn work_unit_name(campaign: &str, batch_index: usize) -> String {
    bounded_name(campaign, &batch_suffix(batch_index))
}

/// Name of a campaign's configuration document.
pub fn config_document_name(campaign: &str) -> String {
    bounded_name(campaign, CONFIG_DOCUMENT_SUFFIX)
}

/// Joins `base` and `suffix`, truncating `base` so the result fits
/// [`MAX_NAME_LEN`].
///
/// The suffix is always kept whole. The base keeps its leading characters
/// and loses trailing `-`/`.` left over from the cut.
pub fn bounded_name(base: &str, suffix: &str) -> String {
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len());

    let mut cut = 0;
    for (offset, ch) in base.char_indices() {
        let end = offset + ch.len_utf8();
        if end > budget {
            break;
        }
        cut = end;
    }

    let prefix = base[..cut].trim_end_matches(['-', '.']);
    let mut name = String::with_capacity(prefix.len() + suffix.len());
    name.push_str(prefix);
    name.push_str(suffix);
    name
}
