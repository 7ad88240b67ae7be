//! ID generation
//!
//! Run and prompt IDs use the format `{6-char-hex}-{type}-{slug}`, e.g.
//! `019430-run-fix-divide`. The hex prefix comes from a UUIDv7 so IDs sort
//! by creation time. Candidate IDs are assigned by the scheduler with
//! zero-padded positional suffixes so lexicographic order equals creation
//! order.

/// Generate an ID from type and title
pub fn generate_id(kind: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let hex_prefix = &uuid.to_string()[..6];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex_prefix, kind)
    } else {
        format!("{}-{}-{}", hex_prefix, kind, slug)
    }
}

/// Slugify a title for use in IDs
fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}
