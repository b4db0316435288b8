//! Token counting
//!
//! Two strategies:
//! - [`WordEstimateTokenizer`]: `ceil(words × ratio)`, no dependencies, deterministic
//! - [`SubwordTokenizer`]: exact counts from a Hugging Face `tokenizer.json`
//!   (requires the `subword` feature)
//!
//! Construction of the subword tokenizer fails loudly when it cannot be loaded.
//! There is no fallback to the word estimate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{MemoryError, Result};

/// Default words → tokens ratio
pub const DEFAULT_WORD_RATIO: f64 = 1.3;

/// Text every subword tokenizer must encode when loaded
#[cfg(feature = "subword")]
const VALIDATION_SAMPLE: &str = "token budget check";

/// Maps text to an estimated token count
pub trait Tokenizer: Send + Sync + fmt::Debug {
    /// Count tokens in `text`; the empty string is 0
    ///
    /// An error means the tokenizer itself is broken. Callers never substitute
    /// another tokenizer's count.
    fn count(&self, text: &str) -> Result<usize>;

    /// Short identifier used in logs
    fn name(&self) -> &str;
}

/// Word-count heuristic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordEstimateTokenizer {
    ratio: f64,
}

impl WordEstimateTokenizer {
    /// Create with a custom ratio
    pub fn new(ratio: f64) -> Result<Self> {
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(MemoryError::config(format!(
                "tokenizer ratio must be a positive number, got {ratio}"
            )));
        }
        Ok(Self { ratio })
    }

    /// Ratio in use
    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

impl Default for WordEstimateTokenizer {
    fn default() -> Self {
        Self {
            ratio: DEFAULT_WORD_RATIO,
        }
    }
}

impl Tokenizer for WordEstimateTokenizer {
    fn count(&self, text: &str) -> Result<usize> {
        let words = text.split_whitespace().count();
        if words == 0 {
            return Ok(0);
        }
        Ok((words as f64 * self.ratio).ceil() as usize)
    }

    fn name(&self) -> &str {
        "word_estimate"
    }
}

/// Exact subword tokenizer backed by Hugging Face `tokenizers`
#[cfg(feature = "subword")]
pub struct SubwordTokenizer {
    model: String,
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "subword")]
impl fmt::Debug for SubwordTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubwordTokenizer")
            .field("model", &self.model)
            .finish()
    }
}

#[cfg(feature = "subword")]
impl SubwordTokenizer {
    /// Load from a local `tokenizer.json` or a Hugging Face hub model id
    pub fn load(model: &str) -> Result<Self> {
        let path = std::path::Path::new(model);
        let file = if path.is_file() {
            path.to_path_buf()
        } else {
            let api = hf_hub::api::sync::Api::new().map_err(|e| {
                MemoryError::config(format!("subword tokenizer unavailable: {e}"))
            })?;
            api.model(model.to_string())
                .get("tokenizer.json")
                .map_err(|e| {
                    MemoryError::config(format!(
                        "subword tokenizer unavailable for model '{model}': {e}"
                    ))
                })?
        };

        let inner = tokenizers::Tokenizer::from_file(&file).map_err(|e| {
            MemoryError::config(format!(
                "subword tokenizer unavailable ({}): {e}",
                file.display()
            ))
        })?;
        let tokenizer = Self {
            model: model.to_string(),
            inner,
        };
        // A definition that cannot encode plain text is rejected here, not at count time
        tokenizer.count(VALIDATION_SAMPLE)?;
        tracing::info!(model, "Loaded subword tokenizer");
        Ok(tokenizer)
    }
}

#[cfg(feature = "subword")]
impl Tokenizer for SubwordTokenizer {
    fn count(&self, text: &str) -> Result<usize> {
        if text.is_empty() {
            return Ok(0);
        }
        let encoding = self.inner.encode(text, false).map_err(|e| {
            MemoryError::config(format!("subword tokenizer '{}' failed to encode: {e}", self.model))
        })?;
        Ok(encoding.len())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Tokenizer selection as it appears in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// `word_estimate` or `subword` (aliases: `huggingface`, `tiktoken`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Model id or path to `tokenizer.json` for the subword tokenizer
    pub model: Option<String>,

    /// Words → tokens ratio for the word estimate
    pub ratio: f64,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: "word_estimate".to_string(),
            model: None,
            ratio: DEFAULT_WORD_RATIO,
        }
    }
}

impl TokenizerConfig {
    /// Build the configured tokenizer
    pub fn build(&self) -> Result<Arc<dyn Tokenizer>> {
        match self.kind.as_str() {
            "word_estimate" | "word" => Ok(Arc::new(WordEstimateTokenizer::new(self.ratio)?)),
            "subword" | "huggingface" | "tiktoken" => self.build_subword(),
            other => Err(MemoryError::config(format!("unknown tokenizer type '{other}'"))),
        }
    }

    #[cfg(feature = "subword")]
    fn build_subword(&self) -> Result<Arc<dyn Tokenizer>> {
        let model = self.model.as_deref().ok_or_else(|| {
            MemoryError::config("subword tokenizer requires a 'model' (hub id or tokenizer.json path)")
        })?;
        Ok(Arc::new(SubwordTokenizer::load(model)?))
    }

    #[cfg(not(feature = "subword"))]
    fn build_subword(&self) -> Result<Arc<dyn Tokenizer>> {
        Err(MemoryError::config(
            "subword tokenizer unavailable: recall-core was built without the `subword` feature",
        ))
    }
}
