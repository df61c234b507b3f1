//! Identity derivation utilities
//! ------------------------------
//! Single source of truth for turning display names into URL-safe slugs.
//! Table identities are unique per owner scope; column identities are
//! unique per table. Both are derived here so the rules never drift.

/// Derive a URL-safe lowercase slug from a display name.
///
/// Alphanumerics are lowercased and kept; any run of other characters
/// collapses to a single hyphen. Leading/trailing hyphens are stripped.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            for lc in ch.to_lowercase() {
                out.push(lc);
            }
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Column identities use underscores, matching form field names:
/// "First Name" -> "first_name".
pub fn column_identity(name: &str) -> String {
    slugify(name).replace('-', "_")
}
