//! SHA-256 content digests and resource-set fingerprints.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Resource name -> content digest, `None` when the resource is absent.
pub type DigestMap = BTreeMap<String, Option<String>>;

pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint of a set of resources. Ordering is by resource name, so two
/// maps with equal entries always fingerprint identically.
pub fn fingerprint(digests: &DigestMap) -> String {
    let mut hasher = Sha256::new();
    for (resource, digest) in digests {
        hasher.update(resource.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_deref().unwrap_or("-").as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Resources whose digest differs between two maps.
pub fn drifted(expected: &DigestMap, actual: &DigestMap) -> Vec<String> {
    expected
        .iter()
        .filter(|(resource, digest)| actual.get(*resource) != Some(*digest))
        .map(|(resource, _)| resource.clone())
        .collect()
}
