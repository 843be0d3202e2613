//! Decision cache keys
//!
//! Keys have the form `check:{user_id}:{fingerprint}` so that every entry of
//! one user can be dropped with the pattern `check:{user_id}:*`. The
//! fingerprint is a BLAKE3 hash over the remaining request inputs.

use blake3::Hasher;

use crate::types::Resource;

const KEY_PREFIX: &str = "check";

/// Cache key for one check
pub fn decision_key(user_id: &str, action: &str, resource: &Resource, domain: Option<&str>) -> String {
    format!("{}:{}:{}", KEY_PREFIX, user_id, fingerprint(action, resource, domain))
}

/// Pattern matching every cached decision of a user
pub fn user_pattern(user_id: &str) -> String {
    format!("{}:{}:*", KEY_PREFIX, user_id)
}

fn fingerprint(action: &str, resource: &Resource, domain: Option<&str>) -> String {
    let mut hasher = Hasher::new();

    // Length-prefix each field so adjacent values cannot run together
    let mut field = |bytes: &[u8]| {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(action.as_bytes());
    field(resource.resource_type.as_bytes());
    field(resource.id.as_deref().unwrap_or("").as_bytes());
    field(&[u8::from(resource.id.is_some())]);
    field(domain.unwrap_or("").as_bytes());
    field(&[u8::from(domain.is_some())]);

    // Attributes are a BTreeMap, so the JSON rendering is key-ordered
    let attributes = serde_json::to_vec(&resource.attributes).unwrap_or_default();
    field(&attributes);

    hasher.finalize().to_hex().to_string()
}
