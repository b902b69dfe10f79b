use sha2::{Digest, Sha256};

/// Version prefix mixed into every key so a change to the hashing rules
/// cannot collide with entries written under the old rules.
pub const HASH_VERSION: &str = "v1";

// ---------------------------------------------------------------------------
// Prompt normalization
// ---------------------------------------------------------------------------

/// Lower-case the prompt and collapse every whitespace run to one space.
///
/// `"Analyze  AAPL\n"` and `"analyze aapl"` normalize to the same string and
/// therefore share a cache slot.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Content-addressed key (SHA-256)
// ---------------------------------------------------------------------------

/// Deterministic SHA-256 hex digest of `(provider, model, symbol, prompt)`.
///
/// Provider, model and symbol are hashed verbatim; only the prompt is
/// normalized.
pub fn cache_key(provider: &str, model: &str, symbol: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();

    hasher.update(HASH_VERSION.as_bytes());
    hasher.update(b":");

    for field in [provider, model, symbol] {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update(field.len().to_string().as_bytes());
        hasher.update(b"#");
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }

    hasher.update(normalize_prompt(prompt).as_bytes());

    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
