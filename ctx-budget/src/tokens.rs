//! Approximate token estimation.

use std::num::NonZeroUsize;

use ctx_memory::Content;

/// Bytes assumed to make up one token.
///
/// A rough average for English text; exact tokenization is not attempted.
pub const DEFAULT_BYTES_PER_TOKEN: usize = 4;

/// Converts content sizes into token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimator {
    bytes_per_token: NonZeroUsize,
}

impl TokenEstimator {
    /// Creates an estimator using the supplied ratio.
    #[must_use]
    pub const fn new(bytes_per_token: NonZeroUsize) -> Self {
        Self { bytes_per_token }
    }

    /// Returns the configured ratio.
    #[must_use]
    pub const fn bytes_per_token(self) -> NonZeroUsize {
        self.bytes_per_token
    }

    /// Estimates the tokens needed for `text`. Never returns zero.
    #[must_use]
    pub fn estimate(self, text: &str) -> usize {
        text.len().div_ceil(self.bytes_per_token.get()).max(1)
    }

    /// Estimates the tokens needed for the textual rendering of `content`.
    #[must_use]
    pub fn estimate_content(self, content: &Content) -> usize {
        content
            .byte_len()
            .div_ceil(self.bytes_per_token.get())
            .max(1)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            bytes_per_token: NonZeroUsize::new(DEFAULT_BYTES_PER_TOKEN).unwrap_or(NonZeroUsize::MIN),
        }
    }
}
