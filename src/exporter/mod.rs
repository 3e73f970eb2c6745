//! Exporter trait shared by the pull and push exporters.
//!
//! Design reference: spec §4.7 (fan-out contract), §4.8, §4.9.

pub mod pull;
pub mod push;

use crate::error::ObsError;
use crate::model::DataPoint;

/// A consumer that renders data points to an external sink. `export` must
/// be effectively O(1) per call — workers call it synchronously once per
/// point and must not block on it longer than necessary (spec §4.7).
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Some exporters are passive (pull); some run their own worker loop
    /// (push's SSE fan-out task is spawned by `main`, not here) — `start`
    /// only needs to flip internal state for passive exporters.
    fn start(&self) -> Result<(), ObsError>;

    fn stop(&self);

    /// Accept one batch (canonically size 1, spec §4.7) of points. Errors
    /// are logged by the caller and never drop the point from the store or
    /// other exporters (spec §7 propagation rules).
    fn export(&self, points: &[DataPoint]) -> Result<(), ObsError>;
}
