//! Verification token generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated verification tokens.
pub const TOKEN_LENGTH: usize = 32;

/// Generate an opaque, URL-safe verification token.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
