//! Stored payload classification.
//!
//! [`classify`] is the single gate every load path goes through before a raw
//! string reaches the codec. It is total: any input, including non-UTF-8
//! lossy conversions and truncated JSON, yields a [`Classification`].
//!
//! Heuristics, in order:
//!
//! 1. absent, empty or whitespace-only → `Empty`
//! 2. literal `undefined` / `null` / `NaN` → `Corrupted`
//! 3. control characters other than `\t`, `\n`, `\r` → `Corrupted`
//! 4. object-stringification marker (`[object ...`) → `Corrupted`
//! 5. JSON parse failure → `Corrupted`
//! 6. otherwise → `Candidate`

use std::fmt;

/// Literal values written by a runtime that stringified a missing value.
const SENTINEL_LITERALS: &[&str] = &["undefined", "null", "NaN"];

/// Prefix produced by stringifying a plain object instead of serializing it.
const OBJECT_MARKER: &str = "[object ";

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    SentinelLiteral(String),
    ControlCharacter { offset: usize },
    ObjectMarker,
    Unparseable(String),
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionReason::SentinelLiteral(lit) => write!(f, "sentinel literal {:?}", lit),
            CorruptionReason::ControlCharacter { offset } => {
                write!(f, "control character at byte {}", offset)
            }
            CorruptionReason::ObjectMarker => write!(f, "object stringification marker"),
            CorruptionReason::Unparseable(e) => write!(f, "unparseable: {}", e),
        }
    }
}

/// Result of screening a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Empty,
    Corrupted(CorruptionReason),
    Candidate,
}

impl Classification {
    pub fn is_candidate(&self) -> bool {
        matches!(self, Classification::Candidate)
    }
}

/// Classify a raw stored payload. Never panics.
pub fn classify(raw: Option<&str>) -> Classification {
    let Some(raw) = raw else {
        return Classification::Empty;
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Classification::Empty;
    }

    if let Some(lit) = SENTINEL_LITERALS.iter().find(|lit| **lit == trimmed) {
        return Classification::Corrupted(CorruptionReason::SentinelLiteral(lit.to_string()));
    }

    if let Some((offset, _)) = raw
        .char_indices()
        .find(|(_, c)| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Classification::Corrupted(CorruptionReason::ControlCharacter { offset });
    }

    if trimmed.starts_with(OBJECT_MARKER) {
        return Classification::Corrupted(CorruptionReason::ObjectMarker);
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => Classification::Candidate,
        Err(e) => Classification::Corrupted(CorruptionReason::Unparseable(e.to_string())),
    }
}
