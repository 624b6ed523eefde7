//! Canonical label normalization.
//!
//! Every tag name and synonym passes through here before any lookup or
//! write, so the registry compares and stores one consistent form:
//! lowercase kebab-case with only alphanumeric characters and hyphens.

/// Normalizes a single label to lowercase kebab-case.
///
/// # Normalization rules
///
/// - Converts to lowercase
/// - Replaces spaces with hyphens
/// - Removes all characters except alphanumeric and hyphens
/// - Collapses consecutive hyphens, trims leading/trailing hyphens
///
/// # Examples
///
/// ```
/// use taxo::registry::normalize_label;
///
/// assert_eq!(normalize_label("RUST"), "rust");
/// assert_eq!(normalize_label("Machine Learning!"), "machine-learning");
/// assert_eq!(normalize_label("  --k8s--  "), "k8s");
/// ```
#[must_use]
pub fn normalize_label(label: &str) -> String {
    let filtered = label
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect::<String>();

    filtered
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalizes a collection of labels, dropping duplicates and empties.
///
/// Preserves the order of first occurrence.
#[must_use]
pub fn normalize_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    labels
        .into_iter()
        .map(|label| normalize_label(label.as_ref()))
        .filter(|label| !label.is_empty() && seen.insert(label.clone()))
        .collect()
}
