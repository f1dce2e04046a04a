//! Shared broker object names (spec.md §6, "Broker objects").

pub const DEAD_LETTERS: &str = "dead-letters";
pub const EXPIRE_MARKER_PREFIX: &str = "expire.bind.";
pub const X_DEATH_HEADER: &str = "x-death";
