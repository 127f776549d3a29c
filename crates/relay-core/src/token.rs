//! Completion-token minting and validation.
//!
//! Every step is issued a completion token when it is created. The token is
//! the sole credential authorizing that step's completion: the completion
//! protocol must present it, and a mismatch is treated as a forgery attempt.
//!
//! Tokens are:
//! - **Unguessable**: 256 bits of OS-provided randomness
//! - **Opaque**: compared for equality, never decoded
//! - **Redacted**: the value never appears in `Debug` output or logs

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Number of random bytes backing a token.
const TOKEN_BYTES: usize = 32;

/// An opaque, unguessable credential authorizing one step's completion.
///
/// The engine holds the issued token; the step instance carries a copy and
/// presents it when reporting completion. Nothing else ever sees the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompletionToken(String);

impl CompletionToken {
    /// Mints a fresh token from OS randomness.
    #[must_use]
    pub fn mint() -> Self {
        use fmt::Write;

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);

        let mut encoded = String::with_capacity(TOKEN_BYTES * 2);
        for byte in bytes {
            let _ = write!(encoded, "{byte:02x}");
        }
        Self(encoded)
    }

    /// Compares this token against a presented one in constant time.
    ///
    /// Equality checks over secrets must not leak position information
    /// through timing, so every byte is always examined.
    #[must_use]
    pub fn matches(&self, presented: &Self) -> bool {
        let a = self.0.as_bytes();
        let b = presented.0.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionToken(<redacted>)")
    }
}
