//! Domain ID generation
//!
//! Features use the readable format `{6-char-hex}-{type}-{slug}`
//! (e.g. `01a4f2-feat-player-movement`); uniqueness comes from the slug,
//! so callers must keep names distinct within a project.
//!
//! High-volume records (runs, checkpoints) repeat their slug constantly,
//! so they get a random suffix instead of relying on it.

/// Generate a domain ID from type and title
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let hex_prefix = &uuid.to_string()[..6];
    format!("{}-{}-{}", hex_prefix, domain_type, slugify(title))
}

/// Generate a domain ID whose uniqueness does not depend on the slug
///
/// The prefix is taken from the random tail of a v7 UUID; the timestamp
/// head would collide for records created close together.
pub fn generate_event_id(domain_type: &str, slug_src: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    format!("{}-{}-{}", &uuid[22..], domain_type, slugify(slug_src))
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
        .collect::<Vec<_>>()
        .join("-")
}
