//! Token-usage extraction from captured agent output.
//!
//! Extraction is agent-family-specific, so the core only defines the seam:
//! an extractor registered for a profile's family gets a best-effort look
//! at the captured output. The registry ships empty; absence of a match is
//! never an error.

use serde::{Deserialize, Serialize};

/// Token counts parsed from one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by prompts.
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
}

/// Parses token-usage figures out of one agent family's output format.
pub trait UsageExtractor: Send + Sync {
    /// Family name this extractor handles (matched against the profile).
    fn family(&self) -> &str;

    /// Best-effort extraction; `None` when the output carries no usage.
    fn extract(&self, output: &str) -> Option<TokenUsage>;
}

/// Registry of usage extractors, keyed by agent family.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn UsageExtractor>>,
}

impl ExtractorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extractor for its family.
    pub fn register(&mut self, extractor: Box<dyn UsageExtractor>) {
        self.extractors.push(extractor);
    }

    /// Run the extractor registered for `family` over `output`.
    pub fn extract(&self, family: Option<&str>, output: &str) -> Option<TokenUsage> {
        let family = family?;
        self.extractors
            .iter()
            .find(|e| e.family() == family)
            .and_then(|e| e.extract(output))
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("families", &self.extractors.iter().map(|e| e.family()).collect::<Vec<_>>())
            .finish()
    }
}
