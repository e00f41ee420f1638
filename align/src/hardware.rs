//! Imaging hardware used by the overlay calibration
//!
//! Every operation that takes time returns a `TaskFuture`, so the scanner can
//! wait on it, and cancel it if the calibration itself gets cancelled.

use calibscan_tasks::TaskFuture;
use ndarray::Array2;
use std::sync::Arc;
use std::time::Duration;

/// A grey-level image, row-major
pub type Frame = Array2<f64>;

/// The beam scanner, the optical camera and the secondary detector.
///
/// Beam positions are in meters, relative to the center of the field of
/// view, with Y pointing up.
pub trait OverlayHardware: Send + Sync {
    /// Move the beam spot to `target`; cancellable while in flight
    fn move_beam(&self, target: (f64, f64)) -> TaskFuture<()>;

    /// Grab a frame from the optical camera
    fn acquire_optical(&self) -> TaskFuture<Frame>;

    /// Grab a frame from the secondary (beam) detector
    fn acquire_secondary(&self) -> TaskFuture<Frame>;

    /// Halt any motion or acquisition right away, best effort
    fn stop(&self);

    /// Size of an optical camera pixel, in meters
    fn optical_pixel_size(&self) -> f64;

    /// Exposure of each acquisition
    fn set_dwell_time(&self, dwell: Duration);
}

/// Shared hardware handle
pub type SharedHardware = Arc<dyn OverlayHardware>;
