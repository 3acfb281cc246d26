#![forbid(unsafe_code)]

use thiserror::Error;

/// Errors surfaced to rule-load and management callers. Nothing here is
/// fatal to the packet path; a failing request leaves all state unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unrecognized tcp flag letter '{0}'")]
    InvalidFlagLetter(char),
    #[error("malformed tcp flag literal \"{0}\"")]
    BadFlagLiteral(String),
    #[error("unknown tunable \"{0}\"")]
    UnknownTunable(String),
    #[error("value {value} for tunable \"{name}\" outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Rule-list validation failures, reported at load time; a rejected list
/// never replaces the active one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule {index}: address predicate family differs from the rule family")]
    MixedFamilies { index: usize },
    #[error("rule {index}: tcp flag predicate on non-tcp rule")]
    FlagsOnNonTcp { index: usize },
    #[error("rule {index}: skip {count} jumps past the end of the list")]
    SkipOutOfRange { index: usize, count: u32 },
    #[error("rule {index}: required flags {set:#06x} with empty mask")]
    EmptyMaskWithFlags { index: usize, set: u16 },
}
