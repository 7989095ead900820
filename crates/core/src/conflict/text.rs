//! Line-based three-way merge of text values.

use tracing::debug;

/// Merge `ours` and `theirs` line by line against their common `base`.
///
/// Returns `None` when the two sides edit overlapping regions.
pub fn merge_text(base: &str, ours: &str, theirs: &str) -> Option<String> {
    // Fast path: if either side is identical to base, the other side wins cleanly.
    if ours == base {
        return Some(theirs.to_string());
    }
    if theirs == base || ours == theirs {
        return Some(ours.to_string());
    }

    match diffy::merge(base, ours, theirs) {
        Ok(merged) => {
            debug!("clean three-way text merge");
            Some(merged)
        }
        Err(_) => {
            debug!("overlapping text edits, no automatic merge");
            None
        }
    }
}
