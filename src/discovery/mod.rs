/// Gauge discovery.
///
/// Submodules, in the order data flows through them:
/// - `generator`: range, pattern and cluster candidate strategies behind a
///   weighted round-robin.
/// - `ratelimit`: rolling-window limiter shared by every upstream request.
/// - `probe`    : one candidate against the lookup API, with retries.
/// - `store`    : deduplicated probe history, gauge records, checkpoints.
/// - `runner`   : bounded worker pool tying the above together.

pub mod generator;
pub mod probe;
pub mod ratelimit;
pub mod runner;
pub mod store;
