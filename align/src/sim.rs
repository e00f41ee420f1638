//! Simulated overlay hardware
//!
//! Renders a Gaussian spot on both detectors. On the secondary detector the
//! spot always sits at the center of the frame; on the optical camera it is
//! displaced by how far the true beam→optical transform moves the current
//! beam position, plus a checkerboard distortion which no similarity
//! transform can absorb.
//!
//! Each operation runs on the rig's own executor and can be aborted while in
//! flight.

use crate::hardware::{Frame, OverlayHardware};
use crate::transform::SimilarityTransform;
use calibscan_tasks::{
    CancellationHook, Executor, ExecutorConfig, SubmitError, TaskError, TaskFuture,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How often an operation in progress checks whether it was halted
const POLL_PERIOD: Duration = Duration::from_millis(1);

/// Simulated rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedRigConfig {
    /// Side of the square frames, in pixels
    pub frame_size: usize,
    /// Optical pixel size, in meters
    pub pixel_size: f64,
    /// Spot standard deviation, in pixels
    pub spot_sigma: f64,
    /// True beam→optical transform
    pub transform: SimilarityTransform,
    /// Checkerboard distortion amplitude, in meters (0 to disable)
    pub checker_amplitude: f64,
    /// Checkerboard cell size, in meters
    pub checker_period: f64,
    /// Time to move the beam, in seconds
    pub move_time: f64,
    /// Initial acquisition time, in seconds
    pub dwell_time: f64,
}

impl Default for SimulatedRigConfig {
    fn default() -> Self {
        Self {
            frame_size: 32,
            pixel_size: 1e-7,
            spot_sigma: 1.5,
            transform: SimilarityTransform {
                translation: (3e-7, -2e-7),
                scale: 1.0,
                rotation: 0.0,
            },
            checker_amplitude: 5e-8,
            checker_period: 1e-6,
            move_time: 0.001,
            dwell_time: 0.002,
        }
    }
}

/// Handshake between an operation and its cancellation hook
#[derive(Default)]
struct OpControl {
    halted: AtomicBool,
    /// `Some(true)` once completed, `Some(false)` once aborted
    finished: Mutex<Option<bool>>,
    changed: Condvar,
}

impl OpControl {
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn finish(&self, completed: bool) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = Some(completed);
        self.changed.notify_all();
    }

    /// Ask the operation to stop and wait until it has.
    ///
    /// Returns true if it was aborted, false if it completed anyway.
    fn halt(&self) -> bool {
        self.halted.store(true, Ordering::SeqCst);
        let finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = self
            .changed
            .wait_while(finished, |f| f.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *finished == Some(false)
    }
}

/// In-process stand-in for a beam scanner with an optical camera
pub struct SimulatedRig {
    config: SimulatedRigConfig,
    executor: Executor,
    beam: Arc<Mutex<(f64, f64)>>,
    dwell: Arc<Mutex<Duration>>,
}

impl SimulatedRig {
    pub fn new(config: SimulatedRigConfig) -> Result<Self, SubmitError> {
        let executor = Executor::new(ExecutorConfig {
            max_workers: 2,
            thread_name: "sim-rig".to_string(),
        })?;
        let dwell = Duration::try_from_secs_f64(config.dwell_time).unwrap_or_default();
        tracing::info!(
            "[SIM] Rig ready: {}x{} px frames, {:e} m/px",
            config.frame_size,
            config.frame_size,
            config.pixel_size
        );
        Ok(Self {
            config,
            executor,
            beam: Arc::new(Mutex::new((0.0, 0.0))),
            dwell: Arc::new(Mutex::new(dwell)),
        })
    }

    pub fn config(&self) -> &SimulatedRigConfig {
        &self.config
    }

    pub fn beam_position(&self) -> (f64, f64) {
        *self.beam.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dwell_time(&self) -> Duration {
        *self.dwell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when no operation is queued or in progress
    pub fn is_idle(&self) -> bool {
        self.executor.outstanding() == 0
    }

    /// Where the spot lands on the optical camera, as (row, col) pixels
    fn optical_spot(config: &SimulatedRigConfig, beam: (f64, f64)) -> (f64, f64) {
        let (mut x, mut y) = config.transform.apply(beam);
        if config.checker_amplitude != 0.0 && config.checker_period > 0.0 {
            let cell = (beam.0 / config.checker_period).round() as i64
                + (beam.1 / config.checker_period).round() as i64;
            let sign = if cell.rem_euclid(2) == 0 { 1.0 } else { -1.0 };
            x += sign * config.checker_amplitude;
            y += sign * config.checker_amplitude;
        }

        let center = (config.frame_size / 2) as f64;
        let dx = (x - beam.0) / config.pixel_size;
        let dy = (y - beam.1) / config.pixel_size;
        // Image rows grow downwards
        (center - dy, center + dx)
    }

    /// Run `finish` after `duration` on the rig executor, unless halted first
    fn run_op<T, F>(&self, label: &'static str, duration: Duration, finish: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let control = Arc::new(OpControl::default());
        let hook_control = control.clone();
        let hook: CancellationHook = Arc::new(move || hook_control.halt());

        let body = move || {
            let deadline = Instant::now() + duration;
            loop {
                if control.is_halted() {
                    tracing::debug!("[SIM] {} aborted", label);
                    control.finish(false);
                    return Err(TaskError::Cancelled);
                }
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                thread::sleep(left.min(POLL_PERIOD));
            }
            let value = finish();
            control.finish(true);
            Ok(value)
        };

        match self.executor.submit_cancellable(body, hook) {
            Ok(future) => future,
            Err(e) => {
                tracing::error!("[SIM] Cannot {}: {}", label, e);
                TaskFuture::failed(TaskError::failed(e))
            }
        }
    }

    fn acquire(&self, label: &'static str, optical: bool) -> TaskFuture<Frame> {
        let config = self.config.clone();
        let beam = self.beam.clone();
        self.run_op(label, self.dwell_time(), move || {
            let position = *beam.lock().unwrap_or_else(PoisonError::into_inner);
            let spot = if optical {
                Self::optical_spot(&config, position)
            } else {
                let center = (config.frame_size / 2) as f64;
                (center, center)
            };
            render_spot(config.frame_size, spot, config.spot_sigma)
        })
    }
}

/// Gaussian spot of unit amplitude over a dark background
fn render_spot(size: usize, center: (f64, f64), sigma: f64) -> Frame {
    let denom = 2.0 * sigma * sigma;
    Array2::from_shape_fn((size, size), |(r, c)| {
        let dr = r as f64 - center.0;
        let dc = c as f64 - center.1;
        (-(dr * dr + dc * dc) / denom).exp()
    })
}

impl OverlayHardware for SimulatedRig {
    fn move_beam(&self, target: (f64, f64)) -> TaskFuture<()> {
        tracing::trace!("[SIM] Moving beam to ({:e}, {:e})", target.0, target.1);
        let beam = self.beam.clone();
        let duration = Duration::try_from_secs_f64(self.config.move_time).unwrap_or_default();
        self.run_op("move beam", duration, move || {
            *beam.lock().unwrap_or_else(PoisonError::into_inner) = target;
        })
    }

    fn acquire_optical(&self) -> TaskFuture<Frame> {
        self.acquire("acquire optical frame", true)
    }

    fn acquire_secondary(&self) -> TaskFuture<Frame> {
        self.acquire("acquire secondary frame", false)
    }

    fn stop(&self) {
        tracing::info!("[SIM] Stopping all beam and camera activity");
        self.executor.cancel();
    }

    fn optical_pixel_size(&self) -> f64 {
        self.config.pixel_size
    }

    fn set_dwell_time(&self, dwell: Duration) {
        tracing::info!("[SIM] Dwell time set to {:?}", dwell);
        *self.dwell.lock().unwrap_or_else(PoisonError::into_inner) = dwell;
    }
}
