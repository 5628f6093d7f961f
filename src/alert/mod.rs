/// Threshold cache and downstream flood checks.
///
/// Submodules:
/// - `thresholds`: per-gauge threshold cache and severity evaluation.
/// - `staleness` : refresh-age checks for cached thresholds.

pub mod staleness;
pub mod thresholds;
