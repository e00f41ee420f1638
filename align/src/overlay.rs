//! Beam/optical overlay calibration
//!
//! The beam is moved over a grid of points. At each point one optical frame
//! and one secondary frame are acquired; their drift tells where the beam
//! spot lands in optical coordinates. A similarity transform is then fitted
//! over all the correspondences.
//!
//! The calibration runs on its own thread and reports its progress through a
//! progressive `TaskFuture`. Cancelling that future aborts the hardware
//! operation in flight and stops the rig.

use crate::drift::estimate_drift;
use crate::error::AlignError;
use crate::hardware::{Frame, SharedHardware};
use crate::transform::{grid_ratio, SimilarityTransform, TransformFit, TransformMetadata};
use calibscan_tasks::{execute_task, Cancellable, TaskError, TaskFuture, TaskId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Maximum number of grid scans before giving up
pub const MAX_TRIALS_NUMBER: u32 = 2;

/// Name of the thread running a calibration
const SCAN_THREAD_NAME: &str = "SEM/CCD overlay";

/// Beyond this X/Y ratio, the beam scanner likely needs calibration
const GRID_RATIO_RANGE: (f64, f64) = (0.9, 1.1);

/// Overlay calibration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Number of (rows, columns) of the grid
    pub grid: (usize, usize),
    /// Distance between two grid points, in meters
    pub spacing: f64,
    /// Acquisition time per frame, in seconds
    pub dwell_time: f64,
    /// Largest distance between a point and the fitted transform for the
    /// point to be kept, in meters
    pub max_allowed_diff: f64,
    /// Largest acceptable RMS residual of the final fit, in meters
    pub max_diff: f64,
    /// Drift estimation precision, in 1/pixel
    pub precision: u32,
    /// Number of grid scans to try
    pub max_trials: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            grid: (7, 7),
            spacing: 1e-6,
            dwell_time: 0.002,
            max_allowed_diff: 1e-6,
            max_diff: 1e-6,
            precision: 4,
            max_trials: MAX_TRIALS_NUMBER,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<(), AlignError> {
        let (rows, cols) = self.grid;
        if rows < 1 || cols < 1 || rows.checked_mul(cols).is_none() {
            return Err(AlignError::InvalidGrid { rows, cols });
        }
        if self.precision < 1 {
            return Err(AlignError::InvalidPrecision(self.precision));
        }
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return Err(AlignError::InvalidParameter(format!(
                "spacing must be positive, got {}",
                self.spacing
            )));
        }
        if !(self.dwell_time.is_finite() && self.dwell_time >= 0.0) {
            return Err(AlignError::InvalidParameter(format!(
                "dwell time must be non-negative, got {}",
                self.dwell_time
            )));
        }
        if !(self.max_allowed_diff > 0.0) {
            return Err(AlignError::InvalidParameter(format!(
                "max_allowed_diff must be positive, got {}",
                self.max_allowed_diff
            )));
        }
        if !(self.max_diff >= 0.0) {
            return Err(AlignError::InvalidParameter(format!(
                "max_diff must be non-negative, got {}",
                self.max_diff
            )));
        }
        if self.max_trials < 1 {
            return Err(AlignError::InvalidParameter(
                "at least one trial is needed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Position of a point in the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPoint {
    pub row: usize,
    pub col: usize,
}

/// Where the beam was sent, and where the optical camera saw it, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub point: GridPoint,
    pub beam: (f64, f64),
    pub optical: (f64, f64),
}

/// Outcome of a successful calibration
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentResult {
    /// Beam → optical transform
    pub transform: SimilarityTransform,
    /// RMS distance of the kept correspondences to the transform, in meters
    pub residual: f64,
    pub metadata: TransformMetadata,
    /// Correspondences used for the final fit
    pub correspondences: Vec<Correspondence>,
    /// Dwell time which eventually worked, in seconds
    pub dwell_time: f64,
    /// Scanned grid X/Y ratio, if measurable
    pub grid_ratio: Option<f64>,
}

/// Expected duration of a grid scan
pub fn estimate_overlay_time(dwell_time: f64, grid: (usize, usize)) -> Duration {
    let points = grid.0.saturating_mul(grid.1) as f64;
    Duration::try_from_secs_f64(dwell_time * points).unwrap_or_default()
}

/// Calibrate the overlay with default settings for everything but the grid
/// and the tolerances.
pub fn find_overlay(
    grid: (usize, usize),
    max_allowed_diff: f64,
    max_diff: f64,
    hardware: SharedHardware,
) -> TaskFuture<AlignmentResult> {
    find_overlay_with(
        OverlayConfig {
            grid,
            max_allowed_diff,
            max_diff,
            ..Default::default()
        },
        hardware,
    )
}

/// Start an overlay calibration.
///
/// Invalid settings give an already failed future.
pub fn find_overlay_with(
    config: OverlayConfig,
    hardware: SharedHardware,
) -> TaskFuture<AlignmentResult> {
    if let Err(e) = config.validate() {
        tracing::warn!("Not starting overlay calibration: {}", e);
        return TaskFuture::failed(e.into());
    }

    let expected = estimate_overlay_time(config.dwell_time, config.grid);
    let now = Utc::now();
    let end = chrono::Duration::from_std(expected).map_or(now, |d| now + d);
    let future = TaskFuture::progressive(now, end);
    future.set_expected_duration(expected);

    let scan = Arc::new(OverlayScan::new(config, hardware));
    let hook_scan = scan.clone();
    future.set_cancellation_hook(Arc::new(move || hook_scan.cancel()));

    let task_future = future.clone();
    let spawned = execute_task(SCAN_THREAD_NAME, &future, move || scan.run(&task_future));
    if let Err(e) = spawned {
        tracing::error!("Failed to start overlay calibration: {}", e);
        if future.set_running_or_notify_cancel() {
            future.set_error(AlignError::Spawn(e.to_string()).into());
        }
    }
    future
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Init,
    Scanning,
    Done,
    Failed,
    Cancelled,
}

struct ScanControl {
    phase: ScanPhase,
    /// Hardware operations not over yet
    in_flight: Vec<Arc<dyn Cancellable>>,
}

/// State shared by a running calibration and its cancellation hook
struct OverlayScan {
    config: OverlayConfig,
    hardware: SharedHardware,
    control: Mutex<ScanControl>,
}

impl OverlayScan {
    fn new(config: OverlayConfig, hardware: SharedHardware) -> Self {
        Self {
            config,
            hardware,
            control: Mutex::new(ScanControl {
                phase: ScanPhase::Init,
                in_flight: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScanControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.lock().phase == ScanPhase::Cancelled
    }

    fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancellation hook: returns once the hardware has stopped
    fn cancel(&self) -> bool {
        let in_flight = {
            let mut control = self.lock();
            match control.phase {
                ScanPhase::Done | ScanPhase::Failed => return false,
                ScanPhase::Cancelled => return true,
                ScanPhase::Init | ScanPhase::Scanning => {}
            }
            control.phase = ScanPhase::Cancelled;
            std::mem::take(&mut control.in_flight)
        };

        tracing::info!(
            "Cancelling overlay calibration, {} operation(s) in flight",
            in_flight.len()
        );
        for op in in_flight {
            if !op.cancel() {
                op.wait(None);
            }
        }
        self.hardware.stop();
        true
    }

    fn run(&self, future: &TaskFuture<AlignmentResult>) -> Result<AlignmentResult, TaskError> {
        {
            let mut control = self.lock();
            if control.phase == ScanPhase::Cancelled {
                return Err(TaskError::Cancelled);
            }
            control.phase = ScanPhase::Scanning;
        }
        tracing::info!(
            "Starting overlay calibration on a {}x{} grid",
            self.config.grid.0,
            self.config.grid.1
        );

        let outcome = self.calibrate(future);

        let mut control = self.lock();
        if control.phase == ScanPhase::Cancelled {
            tracing::info!("Overlay calibration cancelled");
            return Err(TaskError::Cancelled);
        }
        control.phase = if outcome.is_ok() {
            ScanPhase::Done
        } else {
            ScanPhase::Failed
        };
        drop(control);

        if let Err(e) = &outcome {
            tracing::warn!("Overlay calibration failed: {}", e);
        }
        outcome
    }

    fn calibrate(&self, future: &TaskFuture<AlignmentResult>) -> Result<AlignmentResult, TaskError> {
        let grid = self.config.grid;
        let mut dwell = self.config.dwell_time;

        for trial in 0..self.config.max_trials {
            self.checkpoint()?;
            self.hardware
                .set_dwell_time(Duration::try_from_secs_f64(dwell).unwrap_or_default());
            future.set_time_left(estimate_overlay_time(dwell, grid));

            let correspondences = self.scan_grid(future, dwell)?;
            self.checkpoint()?;

            let optical: Vec<_> = correspondences.iter().map(|c| c.optical).collect();
            let ratio = grid_ratio(&optical, grid);
            match ratio {
                Some(r) if !(GRID_RATIO_RANGE.0 < r && r < GRID_RATIO_RANGE.1) => {
                    tracing::warn!("Beam scanner may need calibration. X/Y ratio is {:.3}", r)
                }
                Some(r) => tracing::info!("Beam scanner X/Y ratio is {:.3}", r),
                None => {}
            }

            if let Some((fit, kept)) = self.match_points(&correspondences)? {
                return self.conclude(fit, kept, dwell, ratio);
            }
            if trial + 1 < self.config.max_trials {
                dwell = dwell * 1.2 + 0.1;
                tracing::warn!("Trying with dwell time = {} s...", dwell);
            }
        }

        Err(AlignError::OverlayFailure {
            max_allowed_diff: self.config.max_allowed_diff,
            trials: self.config.max_trials,
        }
        .into())
    }

    /// Beam position of a grid point, the grid being centred on the origin
    fn beam_position(&self, point: GridPoint) -> (f64, f64) {
        let (rows, cols) = self.config.grid;
        let x = (point.col as f64 - (cols - 1) as f64 / 2.0) * self.config.spacing;
        let y = ((rows - 1) as f64 / 2.0 - point.row as f64) * self.config.spacing;
        (x, y)
    }

    fn scan_grid(
        &self,
        future: &TaskFuture<AlignmentResult>,
        dwell: f64,
    ) -> Result<Vec<Correspondence>, TaskError> {
        let (rows, cols) = self.config.grid;
        let total = rows * cols;
        let pixel_size = self.hardware.optical_pixel_size();
        let mut correspondences = Vec::with_capacity(total);

        for (i, (row, col)) in (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .enumerate()
        {
            let point = GridPoint { row, col };
            let beam = self.beam_position(point);

            self.await_op("move the beam", || self.hardware.move_beam(beam))?;
            let optical: Frame =
                self.await_op("acquire an optical frame", || self.hardware.acquire_optical())?;
            let secondary: Frame = self.await_op("acquire a secondary frame", || {
                self.hardware.acquire_secondary()
            })?;

            // optical[r, c] is roughly secondary[r - dr, c - dc]
            let (dr, dc) = estimate_drift(&optical, &secondary, self.config.precision)?;
            // Image rows grow downwards, Y grows upwards
            let seen = (beam.0 + dc * pixel_size, beam.1 - dr * pixel_size);
            tracing::debug!(
                "Point ({}, {}): beam ({:e}, {:e}) seen at ({:e}, {:e})",
                row,
                col,
                beam.0,
                beam.1,
                seen.0,
                seen.1
            );
            correspondences.push(Correspondence {
                point,
                beam,
                optical: seen,
            });

            future.set_time_left(estimate_overlay_time(dwell, (1, total - i - 1)));
            self.checkpoint()?;
        }

        Ok(correspondences)
    }

    /// Start a hardware operation, unless cancelled, and wait for it
    fn await_op<T, F>(&self, operation: &'static str, start: F) -> Result<T, TaskError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> TaskFuture<T>,
    {
        let op = {
            let mut control = self.lock();
            if control.phase == ScanPhase::Cancelled {
                return Err(TaskError::Cancelled);
            }
            let op = start();
            control.in_flight.push(Arc::new(op.clone()));
            op
        };

        let outcome = op.result(None);
        self.untrack(op.id());

        match outcome {
            Ok(value) => Ok(value),
            Err(TaskError::Cancelled) if self.is_cancelled() => Err(TaskError::Cancelled),
            Err(e) => Err(AlignError::hardware(operation, e).into()),
        }
    }

    fn untrack(&self, id: TaskId) {
        self.lock().in_flight.retain(|op| op.id() != id);
    }

    /// Fit, drop the points too far from the fit, and fit again.
    ///
    /// `None` when no point is close enough.
    fn match_points(
        &self,
        correspondences: &[Correspondence],
    ) -> Result<Option<(TransformFit, Vec<Correspondence>)>, AlignError> {
        let (beam, optical) = split(correspondences);
        let first = SimilarityTransform::fit(&beam, &optical)?;

        let kept: Vec<Correspondence> = correspondences
            .iter()
            .filter(|c| first.transform.error(c.beam, c.optical) <= self.config.max_allowed_diff)
            .copied()
            .collect();
        if kept.is_empty() {
            tracing::warn!(
                "No point within {:e} m of the fitted transform",
                self.config.max_allowed_diff
            );
            return Ok(None);
        }
        if kept.len() == correspondences.len() {
            return Ok(Some((first, kept)));
        }

        tracing::info!(
            "Rejected {} of {} points farther than {:e} m",
            correspondences.len() - kept.len(),
            correspondences.len(),
            self.config.max_allowed_diff
        );
        let (beam, optical) = split(&kept);
        let fit = SimilarityTransform::fit(&beam, &optical)?;
        Ok(Some((fit, kept)))
    }

    fn conclude(
        &self,
        fit: TransformFit,
        kept: Vec<Correspondence>,
        dwell: f64,
        ratio: Option<f64>,
    ) -> Result<AlignmentResult, TaskError> {
        if fit.residual > self.config.max_diff {
            return Err(AlignError::OutOfTolerance {
                residual: fit.residual,
                max_diff: self.config.max_diff,
            }
            .into());
        }

        let t = &fit.transform;
        tracing::info!(
            "Overlay calibration done: translation ({:e}, {:e}) m, scale {:.5}, rotation {:.5} rad, residual {:e} m",
            t.translation.0,
            t.translation.1,
            t.scale,
            t.rotation,
            fit.residual
        );
        Ok(AlignmentResult {
            transform: fit.transform,
            residual: fit.residual,
            metadata: fit.transform.metadata(),
            correspondences: kept,
            dwell_time: dwell,
            grid_ratio: ratio,
        })
    }
}

fn split(correspondences: &[Correspondence]) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    correspondences.iter().map(|c| (c.beam, c.optical)).unzip()
}
