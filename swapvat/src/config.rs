//! Vat tuning knobs.

/// Configuration for a [`Vat`](crate::vat::Vat).
#[derive(Debug, Clone)]
pub struct VatConfig {
    /// Number of state records the in-RAM cache may hold. Zero is legal
    /// and forces a store round-trip per state access.
    pub cache_size: usize,
    /// Permit otherwise-forbidden slot types (promises, non-durable
    /// objects) inside durable state. Used by test environments that
    /// never actually restart.
    pub relax_durability_rules: bool,
}

impl Default for VatConfig {
    fn default() -> Self {
        Self {
            cache_size: 3,
            relax_durability_rules: false,
        }
    }
}

impl VatConfig {
    /// Override the state cache capacity.
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Relax durability checking.
    pub fn with_relaxed_durability(mut self) -> Self {
        self.relax_durability_rules = true;
        self
    }
}
