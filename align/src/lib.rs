//! Overlay calibration between a scanning beam and an optical camera
//!
//! - `drift`: sub-pixel translation between two frames by phase correlation
//! - `transform`: similarity transform fitting
//! - `overlay`: the grid scan, run as a cancellable progressive task
//! - `sim`: a simulated rig implementing `OverlayHardware`

pub mod drift;
pub mod error;
pub mod hardware;
pub mod overlay;
pub mod sim;
pub mod transform;

pub use drift::estimate_drift;
pub use error::AlignError;
pub use hardware::{Frame, OverlayHardware, SharedHardware};
pub use overlay::{
    estimate_overlay_time, find_overlay, find_overlay_with, AlignmentResult, Correspondence,
    GridPoint, OverlayConfig, MAX_TRIALS_NUMBER,
};
pub use sim::{SimulatedRig, SimulatedRigConfig};
pub use transform::{grid_ratio, SimilarityTransform, TransformFit, TransformMetadata};
