//! Security audit events.
//!
//! Events are emitted under the [`TARGET`] tracing target, which the
//! subscriber routes to its own sink. Token values never appear in them, only
//! [`fingerprint`]s.

use sha2::{Digest, Sha256};
use std::fmt::Write;

pub const TARGET: &str = "audit";

const FINGERPRINT_BYTES: usize = 8;

/// Truncated SHA-256 of a token, hex encoded.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest
        .iter()
        .take(FINGERPRINT_BYTES)
        .fold(String::with_capacity(FINGERPRINT_BYTES * 2), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}
