//! Policy filtering of heuristic engine configurations.
//!
//! Some engines trade determinism or precision for speed. The filter drops
//! every configuration the caller's [`ConvPolicy`] forbids before any plan is
//! compiled. It never reorders: survivors keep their heuristic rank.

use crate::config::ConvOptions;
use crate::dtype::DataType;
use crate::engine::{EngineConfig, NumericalNotes};

/// What the caller allows an engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvPolicy {
    /// Reject non-deterministic engines.
    pub deterministic: bool,
    /// Allow reduced-precision engines for operands other than `Float`.
    pub allow_tf32: bool,
    /// Element type of the operands.
    pub data_type: DataType,
    /// Additional notes that disqualify an engine outright.
    pub excluded_notes: NumericalNotes,
}

impl ConvPolicy {
    pub const fn new(deterministic: bool, allow_tf32: bool, data_type: DataType) -> Self {
        Self { deterministic, allow_tf32, data_type, excluded_notes: NumericalNotes::empty() }
    }

    pub const fn from_options(options: &ConvOptions, data_type: DataType) -> Self {
        Self::new(options.deterministic, options.allow_tf32, data_type)
    }

    #[must_use]
    pub const fn exclude(mut self, notes: NumericalNotes) -> Self {
        self.excluded_notes = self.excluded_notes.union(notes);
        self
    }

    /// Whether reduced-precision engines are off the table.
    pub const fn requires_full_precision(&self) -> bool {
        matches!(self.data_type, DataType::Float) || !self.allow_tf32
    }
}

/// Whether `policy` forbids `config`.
pub fn is_excluded(policy: &ConvPolicy, config: &EngineConfig) -> bool {
    if policy.deterministic && config.is_nondeterministic() {
        return true;
    }
    if policy.requires_full_precision()
        && (config.is_downconverting_inputs() || config.has_numerical_note(NumericalNotes::TENSOR_CORE))
    {
        return true;
    }
    config.notes.intersects(policy.excluded_notes)
}

/// The configurations `policy` allows, in their original order.
pub fn filter_engine_configs(configs: &[EngineConfig], policy: &ConvPolicy) -> Vec<EngineConfig> {
    configs
        .iter()
        .filter(|cfg| {
            let excluded = is_excluded(policy, cfg);
            if excluded {
                log::trace!("policy {policy:?} excludes {cfg}");
            }
            !excluded
        })
        .cloned()
        .collect()
}
