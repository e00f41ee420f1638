//! Error types for drift estimation and overlay calibration

use calibscan_tasks::TaskError;
use thiserror::Error;

/// Errors raised while estimating drift or calibrating the overlay
#[derive(Error, Debug, Clone)]
pub enum AlignError {
    // =========================================================================
    // Input validation
    // =========================================================================
    #[error("Precision must be at least 1, got {0}")]
    InvalidPrecision(u32),

    #[error("Frame shapes differ: {previous:?} vs {current:?}")]
    ShapeMismatch {
        previous: (usize, usize),
        current: (usize, usize),
    },

    #[error("Frame is empty")]
    EmptyFrame,

    #[error("Invalid grid {rows}x{cols}, both sides must be at least 1")]
    InvalidGrid { rows: usize, cols: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // =========================================================================
    // Calibration outcome
    // =========================================================================
    #[error("Overlay calibration out of tolerance: residual {residual:e} m > {max_diff:e} m")]
    OutOfTolerance { residual: f64, max_diff: f64 },

    #[error(
        "Overlay failure: no correspondence within {max_allowed_diff:e} m after {trials} trial(s)"
    )]
    OverlayFailure { max_allowed_diff: f64, trials: u32 },

    #[error("Not enough points to fit a transform")]
    NotEnoughPoints,

    #[error("Transform fit failed: {0}")]
    DegenerateFit(String),

    // =========================================================================
    // Collaborators
    // =========================================================================
    #[error("Hardware failed while trying to {operation}: {source}")]
    Hardware {
        operation: &'static str,
        #[source]
        source: TaskError,
    },

    #[error("Failed to start overlay scan: {0}")]
    Spawn(String),
}

impl AlignError {
    pub(crate) fn hardware(operation: &'static str, source: TaskError) -> Self {
        AlignError::Hardware { operation, source }
    }
}

impl From<AlignError> for TaskError {
    fn from(error: AlignError) -> Self {
        TaskError::failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AlignError::InvalidPrecision(0).to_string(),
            "Precision must be at least 1, got 0"
        );
        let err = AlignError::OutOfTolerance {
            residual: 2e-8,
            max_diff: 1e-8,
        };
        assert!(err.to_string().contains("out of tolerance"));
    }

    #[test]
    fn test_downcast_from_task_error() {
        let task_err: TaskError = AlignError::InvalidGrid { rows: 0, cols: 3 }.into();
        assert!(matches!(
            task_err.downcast_ref::<AlignError>(),
            Some(AlignError::InvalidGrid { rows: 0, cols: 3 })
        ));
    }

    #[test]
    fn test_hardware_error_keeps_source() {
        let err = AlignError::hardware("move the beam", TaskError::Panicked("stuck".into()));
        let msg = err.to_string();
        assert!(msg.contains("move the beam"));
        assert!(msg.contains("stuck"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
