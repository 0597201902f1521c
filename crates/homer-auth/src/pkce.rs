//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! The verifier stays server-side and is sent during token exchange; the
//! challenge goes into the authorization URL so the provider can check that
//! the exchange comes from the party that started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Generate a random PKCE code verifier.
///
/// 64 random bytes as URL-safe base64 without padding: 86 characters, inside
/// the 43-128 range RFC 7636 allows.
pub fn generate_verifier() -> String {
    random_token::<64>()
}

/// Generate an unpredictable anti-forgery `state` value (32 random bytes).
pub fn generate_state() -> String {
    random_token::<32>()
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Whether a verifier satisfies the RFC 7636 length and charset rules.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

fn random_token<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
