use sha2::{Digest, Sha256};

use crate::models::AssistRequest;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Requests that differ only in casing, whitespace or tag order share a fingerprint.
pub fn fingerprint_for(request: &AssistRequest) -> RequestFingerprint {
    let canonical = canonical_payload(request);
    RequestFingerprint(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Every field is length-prefixed, so separator characters inside the text or a
/// tag cannot make two different requests canonicalize to the same bytes.
fn canonical_payload(request: &AssistRequest) -> String {
    let mut payload = String::new();
    push_field(&mut payload, &normalize_text(request.text()));
    // BTreeSet iteration is already sorted.
    for tag in request.context_tags() {
        push_field(&mut payload, tag);
    }
    payload
}

fn push_field(payload: &mut String, field: &str) {
    payload.push_str(&field.len().to_string());
    payload.push(':');
    payload.push_str(field);
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
