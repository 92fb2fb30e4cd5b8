use serde::{Deserialize, Serialize};

// Pricing per million tokens. Informational only; callers treat the
// estimate as advisory.
const INPUT_PRICE_PER_M: f64 = 3.0;
const OUTPUT_PRICE_PER_M: f64 = 15.0;
const CACHE_READ_PRICE_PER_M: f64 = INPUT_PRICE_PER_M * 0.1;
const CACHE_WRITE_PRICE_PER_M: f64 = INPUT_PRICE_PER_M * 1.25;

/// Token counters for one exchange or an accumulated run.
/// Aliases accept the wire names used by the remote API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read_tokens: u64,
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
    }
}

/// Monotone token/cost bookkeeping across turns within a run
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    total: TokenUsage,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, usage: &TokenUsage) {
        self.total += *usage;
    }

    pub fn total(&self) -> TokenUsage {
        self.total
    }

    pub fn reset(&mut self) {
        self.total = TokenUsage::default();
    }

    /// Estimate spend from the fixed price table
    pub fn estimate_cost(&self) -> f64 {
        let u = &self.total;
        (u.input_tokens as f64 / 1_000_000.0) * INPUT_PRICE_PER_M
            + (u.output_tokens as f64 / 1_000_000.0) * OUTPUT_PRICE_PER_M
            + (u.cache_read_tokens as f64 / 1_000_000.0) * CACHE_READ_PRICE_PER_M
            + (u.cache_creation_tokens as f64 / 1_000_000.0) * CACHE_WRITE_PRICE_PER_M
    }
}
