//! Shared size limits agreed with the instrumentation and the runner.

/// Hard cap on the length of any generated input.
pub const MAX_INPUT_SIZE: usize = 1 << 20;

/// Size of the coverage bitmap; rewritten inputs are truncated to it so the
/// replaced bytes stay observable.
pub const COVER_SIZE: usize = 64 << 10;

/// Fixed header of one packed comparison record: u32 id+flags, u8 n1, u8 n2.
pub const SONAR_HDR_LEN: usize = 6;

/// Upper bound on a single reported operand length.
pub const SONAR_MAX_LEN: usize = 20;
