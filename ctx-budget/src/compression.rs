//! Compression strategies applied when projecting entries into a window.

use ctx_memory::{CompressionLevel, Content};

/// Tuning for the lossy strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionParams {
    /// Fraction of characters removed at [`CompressionLevel::Light`], in `(0, 1)`.
    pub light_reduction: f64,
    /// Characters kept at [`CompressionLevel::Heavy`].
    pub heavy_excerpt_chars: usize,
    /// Suffix appended to truncated content.
    pub marker: String,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            light_reduction: 0.5,
            heavy_excerpt_chars: 200,
            marker: "...".to_owned(),
        }
    }
}

/// Pure transformation from original text to compressed text.
pub type Strategy = fn(&str, &CompressionParams) -> String;

fn identity(text: &str, _params: &CompressionParams) -> String {
    text.to_owned()
}

fn light(text: &str, params: &CompressionParams) -> String {
    let total = text.chars().count();
    let ratio = (1.0 - params.light_reduction).clamp(0.0, 1.0);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let keep = (total as f64 * ratio).floor() as usize;
    truncate(text, keep, &params.marker)
}

fn heavy(text: &str, params: &CompressionParams) -> String {
    truncate(text, params.heavy_excerpt_chars, &params.marker)
}

fn truncate(text: &str, keep: usize, marker: &str) -> String {
    match text.char_indices().nth(keep) {
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + marker.len());
            out.push_str(&text[..cut]);
            out.push_str(marker);
            out
        }
        None => text.to_owned(),
    }
}

/// Strategy table keyed by [`CompressionLevel`].
///
/// Output of a stronger level is never longer than output of a weaker one.
#[derive(Debug, Clone)]
pub struct CompressionTable {
    params: CompressionParams,
    strategies: [Strategy; 3],
}

impl CompressionTable {
    /// Creates the default table with the given parameters.
    #[must_use]
    pub fn new(params: CompressionParams) -> Self {
        Self {
            params,
            strategies: [identity, light, heavy],
        }
    }

    /// Returns the parameters.
    #[must_use]
    pub fn params(&self) -> &CompressionParams {
        &self.params
    }

    /// Compresses text at `level`.
    #[must_use]
    pub fn compress_text(&self, level: CompressionLevel, text: &str) -> String {
        let mut out = (self.strategies[slot(level)])(text, &self.params);
        // Clamp against the weaker level so the ordering holds for any params.
        if let Some(weaker) = weaker(level) {
            let bound = self.compress_text(weaker, text);
            if out.len() > bound.len() {
                out = bound;
            }
        }
        out
    }

    /// Compresses content at `level`.
    ///
    /// [`CompressionLevel::None`] returns the content untouched; other levels
    /// render structured content to JSON text first.
    #[must_use]
    pub fn apply(&self, level: CompressionLevel, content: &Content) -> Content {
        match level {
            CompressionLevel::None => content.clone(),
            _ => Content::Text(self.compress_text(level, &content.as_text())),
        }
    }
}

impl Default for CompressionTable {
    fn default() -> Self {
        Self::new(CompressionParams::default())
    }
}

const fn slot(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::None => 0,
        CompressionLevel::Light => 1,
        CompressionLevel::Heavy => 2,
    }
}

const fn weaker(level: CompressionLevel) -> Option<CompressionLevel> {
    match level {
        CompressionLevel::None => None,
        CompressionLevel::Light => Some(CompressionLevel::None),
        CompressionLevel::Heavy => Some(CompressionLevel::Light),
    }
}
