//! Engine configurations reported by heuristics.

/// Numerical-behaviour notes attached to an engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NumericalNotes(u32);

impl NumericalNotes {
    /// Uses tensor-core style reduced-precision multiply-accumulate.
    pub const TENSOR_CORE: Self = Self(1 << 0);
    /// Converts inputs to a narrower type before computing.
    pub const DOWN_CONVERT_INPUTS: Self = Self(1 << 1);
    /// Accumulates in a narrower type than the operands.
    pub const REDUCED_PRECISION_REDUCTION: Self = Self(1 << 2);
    /// FFT-based algorithm.
    pub const FFT: Self = Self(1 << 3);
    /// Reduction order depends on scheduling.
    pub const NONDETERMINISTIC: Self = Self(1 << 4);
    /// Winograd-based algorithm.
    pub const WINOGRAD: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every note in `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any note in `other` is present.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for NumericalNotes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for NumericalNotes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A tuning knob of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Knob {
    pub name: &'static str,
    pub value: i64,
}

/// One candidate strategy for executing an operation graph.
///
/// Opaque to the selection loop apart from its notes; only the runtime that
/// produced it interprets `engine_id` and `knobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub engine_id: i64,
    pub name: &'static str,
    pub notes: NumericalNotes,
    pub knobs: Vec<Knob>,
}

impl EngineConfig {
    pub fn new(engine_id: i64, name: &'static str, notes: NumericalNotes) -> Self {
        Self { engine_id, name, notes, knobs: Vec::new() }
    }

    #[must_use]
    pub fn knob(mut self, name: &'static str, value: i64) -> Self {
        self.knobs.push(Knob { name, value });
        self
    }

    pub fn knob_value(&self, name: &str) -> Option<i64> {
        self.knobs.iter().find(|k| k.name == name).map(|k| k.value)
    }

    pub const fn is_nondeterministic(&self) -> bool {
        self.notes.contains(NumericalNotes::NONDETERMINISTIC)
    }

    pub const fn is_downconverting_inputs(&self) -> bool {
        self.notes.contains(NumericalNotes::DOWN_CONVERT_INPUTS)
    }

    pub const fn has_numerical_note(&self, note: NumericalNotes) -> bool {
        self.notes.contains(note)
    }
}

impl core::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.name, self.engine_id)?;
        for k in &self.knobs {
            write!(f, " {}={}", k.name, k.value)?;
        }
        Ok(())
    }
}

/// How much effort heuristics spend ranking engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeuristicMode {
    /// Fast ranking from a cost model.
    #[default]
    Instant,
    /// Only the most conservative engines.
    Fallback,
}
