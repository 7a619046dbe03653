//! The lock mode algebra.

use std::fmt;

/// A multi-granularity lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum LockMode {
    /// No lock held.
    NL,
    /// Intention shared: shared locks will be requested below.
    IS,
    /// Intention exclusive: exclusive locks will be requested below.
    IX,
    /// Shared.
    S,
    /// Shared + intention exclusive.
    SIX,
    /// Exclusive.
    X,
}

impl LockMode {
    /// All modes, for table-driven tests.
    pub const ALL: [LockMode; 6] = [
        LockMode::NL,
        LockMode::IS,
        LockMode::IX,
        LockMode::S,
        LockMode::SIX,
        LockMode::X,
    ];

    /// Whether a lock of mode `self` held by one transaction can coexist
    /// with a lock of mode `other` held by a different transaction on the
    /// same resource.
    #[must_use]
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (NL, _) | (_, NL) => true,
            (IS, o) => o != X,
            (IX, o) => o == IS || o == IX,
            (S, o) => o == IS || o == S,
            (SIX, o) => o == IS,
            (X, _) => false,
        }
    }

    /// The minimum mode a parent resource must be locked in for a lock of
    /// mode `self` to be granted on a child.
    #[must_use]
    pub fn parent_of(self) -> LockMode {
        use LockMode::*;
        match self {
            S | IS => IS,
            X | IX | SIX => IX,
            NL => NL,
        }
    }

    /// Whether a parent lock of mode `parent` permits granting a lock of
    /// mode `child` on a child resource.
    #[must_use]
    pub fn can_be_parent(parent: LockMode, child: LockMode) -> bool {
        use LockMode::*;
        match child {
            S | IS => parent == IS || parent == IX,
            X | IX | SIX => parent == IX || parent == SIX,
            NL => true,
        }
    }

    /// Whether holding `self` permits every action that holding `required`
    /// would permit.
    #[must_use]
    pub fn substitutable(self, required: LockMode) -> bool {
        use LockMode::*;
        if self == required {
            return true;
        }
        match required {
            NL => true,
            S => self == X || self == SIX,
            IS => self == IX || self == SIX,
            IX => self == SIX,
            X | SIX => false,
        }
    }

    /// Whether this is an intent mode.
    #[must_use]
    pub fn is_intent(self) -> bool {
        matches!(self, LockMode::IS | LockMode::IX | LockMode::SIX)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::NL => "NL",
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::SIX => "SIX",
            LockMode::X => "X",
        };
        f.write_str(s)
    }
}
