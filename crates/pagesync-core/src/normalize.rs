//! Content normalization and change-detection hashing.
//!
//! Formatting noise (line-ending style, trailing spaces, runs of blank
//! lines) must never register as a content change, so every hash in the
//! sync state tracker is taken over the normalized form.

use sha2::{Digest, Sha256};

/// Canonicalize text for hashing and comparison.
///
/// - All line endings become `\n`
/// - Trailing whitespace is stripped per line
/// - Runs of 3+ blank lines collapse to exactly one (leading runs
///   included; trailing blanks fold into the final newline)
/// - Output ends with exactly one trailing newline
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.split('\n') {
        let trimmed = line.trim_end();

        if trimmed.is_empty() {
            blank_run += 1;
            continue;
        }

        // A run of 3+ blank lines collapses to exactly one; leading
        // runs follow the same rule
        let blanks = if blank_run >= 3 { 1 } else { blank_run };
        for _ in 0..blanks {
            out.push('\n');
        }
        blank_run = 0;
        out.push_str(trimmed);
        out.push('\n');
    }

    if out.is_empty() {
        out.push('\n');
    }
    out
}

/// SHA-256 hex digest over the UTF-8 bytes of `normalize(text)`.
///
/// Deterministic; equal content produces equal hashes regardless of
/// line-ending style or trailing whitespace.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
