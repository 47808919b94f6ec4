/// Constant cool-off between attempts.
pub mod fixed;

/// Exponentially growing cool-off, capped and optionally jittered.
pub mod exponential;
