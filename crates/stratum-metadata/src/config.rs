//! Generator configuration.

use tracing::warn;

/// Default cap on fixpoint iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 5000;

/// Configuration for a [`MetadataGenerator`](crate::MetadataGenerator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Iterations after which resolution gives up with `NonTermination`.
    pub max_iterations: usize,

    /// Seed for the reactor scheduling shuffle. Random per resolution when unset.
    pub shuffle_seed: Option<u64>,

    /// Run the conflict validator on every finalized node.
    pub check_conflicts: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl GeneratorConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_iterations = parse_var(&lookup, "STRATUM_MAX_METADATA_ITERATIONS")
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        let shuffle_seed = parse_var(&lookup, "STRATUM_SHUFFLE_SEED");

        let check_conflicts = match lookup("STRATUM_CHECK_METADATA_CONFLICTS") {
            Some(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            None => false,
        };

        Self {
            max_iterations,
            shuffle_seed,
            check_conflicts,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_conflict_check(mut self, enabled: bool) -> Self {
        self.check_conflicts = enabled;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
