//! Adaptive time stepping: the commit/reject state machine and the transient driver loop.
use crate::error::StepError;
use crate::solver::{DivergenceReason, NonlinearOutcome};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

/// Time discretization of the field rates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeScheme {
    #[default]
    BackwardEuler,
    /// Variable step second order backward differences. The first step falls back to
    /// backward Euler.
    Bdf2,
}

/// Weights of `v = current * u + old * u_old + older * u_older`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RateCoefficients {
    pub current: f64,
    pub old: f64,
    pub older: f64,
}

impl TimeScheme {
    /// Rate coefficients for a step of size `dt` following a step of size `dt_old`.
    pub fn rate_coefficients(self, dt: f64, dt_old: Option<f64>) -> RateCoefficients {
        match (self, dt_old) {
            (TimeScheme::Bdf2, Some(dt_old)) => {
                let omega = dt / dt_old;
                RateCoefficients {
                    current: (1.0 + 2.0 * omega) / ((1.0 + omega) * dt),
                    old: -(1.0 + omega) / dt,
                    older: omega * omega / ((1.0 + omega) * dt),
                }
            }
            _ => RateCoefficients {
                current: 1.0 / dt,
                old: -1.0 / dt,
                older: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSteppingSettings {
    pub final_time: f64,
    pub dt0: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    /// Whether converged steps adapt the step size to the Newton iteration count.
    pub adaptive: bool,
    pub optimal_iterations: usize,
    pub growth_factor: f64,
    pub cutback_factor: f64,
    /// Number of consecutive steps converging within `optimal_iterations` before the step
    /// size grows. The initial state counts as a slow step.
    pub growth_window: usize,
    /// Committed steps between two calls to the observer.
    pub output_interval: usize,
    pub scheme: TimeScheme,
}

impl Default for TimeSteppingSettings {
    fn default() -> Self {
        Self {
            final_time: 1e-5,
            dt0: 1e-5,
            dt_min: 1e-12,
            dt_max: 0.1,
            adaptive: false,
            optimal_iterations: 4,
            growth_factor: 1.1,
            cutback_factor: 0.85,
            growth_window: 2,
            output_interval: 1,
            scheme: TimeScheme::BackwardEuler,
        }
    }
}

impl TimeSteppingSettings {
    pub fn validate(&self) -> Result<(), StepError> {
        let invalid = |message: String| Err(StepError::InvalidSettings(message));
        let all_finite = [self.final_time, self.dt0, self.dt_min, self.dt_max, self.growth_factor, self.cutback_factor]
            .iter()
            .all(|x| x.is_finite());
        if !all_finite {
            return invalid("time stepping parameters must be finite".to_string());
        }
        if self.dt_min <= 0.0 || self.dt_min > self.dt_max {
            return invalid(format!(
                "require 0 < dt_min <= dt_max, got dt_min = {}, dt_max = {}",
                self.dt_min, self.dt_max
            ));
        }
        if !(self.dt_min..=self.dt_max).contains(&self.dt0) {
            return invalid(format!(
                "dt0 = {} outside of [{}, {}]",
                self.dt0, self.dt_min, self.dt_max
            ));
        }
        if self.growth_factor < 1.0 {
            return invalid(format!("growth factor {} must be at least 1", self.growth_factor));
        }
        if self.cutback_factor <= 0.0 || self.cutback_factor >= 1.0 {
            return invalid(format!("cutback factor {} must lie in (0, 1)", self.cutback_factor));
        }
        if self.growth_window == 0 || self.output_interval == 0 {
            return invalid("growth window and output interval must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepState {
    Idle,
    Stepping,
    Committed,
    /// Terminal: the step size fell below the minimum.
    Failed,
}

/// A step that has been accepted.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedStep {
    /// Number of committed steps so far, zero for the initial state.
    pub step: usize,
    /// Time at the end of the step.
    pub time: f64,
    /// Size of the step that was taken.
    pub dt: f64,
    pub iterations: usize,
}

/// Owns the step size and decides how it evolves after each attempt.
///
/// The step size always lies within `[dt_min, dt_max]`.
#[derive(Debug, Clone)]
pub struct TimeStepController {
    settings: TimeSteppingSettings,
    state: StepState,
    dt: f64,
    time: f64,
    step: usize,
    /// Consecutive committed steps that converged within the optimal iteration count.
    fast_steps: usize,
}

impl TimeStepController {
    pub fn new(settings: TimeSteppingSettings) -> Result<Self, StepError> {
        settings.validate()?;
        Ok(Self {
            dt: settings.dt0,
            settings,
            state: StepState::Idle,
            time: 0.0,
            step: 0,
            fast_steps: 0,
        })
    }

    pub fn settings(&self) -> &TimeSteppingSettings {
        &self.settings
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Time of the last committed step.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of committed steps.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.time + 1e-10 * self.dt >= self.settings.final_time
    }

    /// The step that [`on_converged`](Self::on_converged) would commit for the current attempt.
    pub fn pending_step(&self, iterations: usize) -> CommittedStep {
        CommittedStep {
            step: self.step + 1,
            time: self.time + self.dt,
            dt: self.dt,
            iterations,
        }
    }

    /// Starts an attempt and returns its step size.
    pub fn begin_step(&mut self) -> f64 {
        debug_assert_ne!(self.state, StepState::Failed);
        self.state = StepState::Stepping;
        self.dt
    }

    /// Commits the current attempt and adapts the step size for the next one.
    pub fn on_converged(&mut self, iterations: usize) -> CommittedStep {
        let dt = self.dt;
        self.time += dt;
        self.step += 1;
        self.state = StepState::Committed;

        let settings = &self.settings;
        if iterations <= settings.optimal_iterations {
            self.fast_steps += 1;
        } else {
            self.fast_steps = 0;
        }

        if settings.adaptive {
            if iterations > settings.optimal_iterations {
                self.dt = (self.dt * settings.cutback_factor).max(settings.dt_min);
            } else if self.fast_steps >= settings.growth_window {
                self.dt = (self.dt * settings.growth_factor).min(settings.dt_max);
            }
        }

        CommittedStep {
            step: self.step,
            time: self.time,
            dt,
            iterations,
        }
    }

    /// Rejects the current attempt and returns the reduced step size of the retry.
    ///
    /// Fails once the reduced step size falls below `dt_min`.
    pub fn on_diverged(&mut self) -> Result<f64, StepError> {
        let reduced = self.dt * self.settings.cutback_factor;
        self.fast_steps = 0;
        if reduced < self.settings.dt_min {
            self.state = StepState::Failed;
            return Err(StepError::TimeStepTooSmall {
                dt: reduced,
                dt_min: self.settings.dt_min,
                last_committed_time: self.time,
                last_committed_step: self.step,
            });
        }
        self.dt = reduced;
        self.state = StepState::Idle;
        Ok(reduced)
    }
}

/// A problem that can be advanced in time by trial steps which are either committed or
/// discarded as a whole.
pub trait TransientProblem {
    /// Solves for the state at `time`, the end of a step of size `dt`.
    fn attempt_step(&mut self, time: f64, dt: f64) -> Result<NonlinearOutcome, StepError>;

    /// Promotes the trial state of the last converged attempt.
    fn commit_step(&mut self, step: &CommittedStep) -> Result<(), StepError>;

    /// Restores the last committed state.
    fn discard_step(&mut self);
}

/// Receives the committed states of a transient run.
pub trait StepObserver<P: ?Sized> {
    fn observe(&mut self, step: &CommittedStep, problem: &mut P) -> eyre::Result<()>;
}

/// Records every observed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepLog {
    pub steps: Vec<CommittedStep>,
}

impl<P: ?Sized> StepObserver<P> for StepLog {
    fn observe(&mut self, step: &CommittedStep, _problem: &mut P) -> eyre::Result<()> {
        self.steps.push(*step);
        Ok(())
    }
}

/// Observer that ignores all steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl<P: ?Sized> StepObserver<P> for NoObserver {
    fn observe(&mut self, _step: &CommittedStep, _problem: &mut P) -> eyre::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransientSummary {
    pub steps: usize,
    pub rejected_attempts: usize,
    pub final_time: f64,
    /// Step size the next step would have used.
    pub next_dt: f64,
}

/// Advances `problem` from t = 0 until the final time is reached.
///
/// The observer sees the initial state, every `output_interval`-th committed step and the final
/// step. A failed attempt is discarded and retried with a reduced step size; the run aborts with
/// [`StepError::TimeStepTooSmall`] once that falls below the minimum. A commit that fails with a
/// recoverable error is treated like a failed attempt.
pub fn run_transient<P, O>(
    problem: &mut P,
    settings: &TimeSteppingSettings,
    observer: &mut O,
) -> Result<TransientSummary, StepError>
where
    P: TransientProblem + ?Sized,
    O: StepObserver<P> + ?Sized,
{
    let mut controller = TimeStepController::new(settings.clone())?;
    let mut rejected_attempts = 0;
    let mut last_committed = None;
    let mut last_observed = 0;

    let initial = CommittedStep {
        step: 0,
        time: 0.0,
        dt: 0.0,
        iterations: 0,
    };
    observer
        .observe(&initial, problem)
        .map_err(StepError::Output)?;

    while !controller.is_finished() {
        let dt = controller.begin_step();
        let time = controller.time() + dt;

        let rejection = match problem.attempt_step(time, dt)? {
            NonlinearOutcome::Converged { iterations, .. } => {
                // The controller only advances once the problem has committed
                match problem.commit_step(&controller.pending_step(iterations)) {
                    Ok(()) => {
                        let committed = controller.on_converged(iterations);
                        last_committed = Some(committed);
                        info!(
                            "Step {} committed: t = {:e}, dt = {:e}, {} Newton iterations",
                            committed.step, committed.time, committed.dt, committed.iterations
                        );
                        if committed.step % settings.output_interval == 0 {
                            observer
                                .observe(&committed, problem)
                                .map_err(StepError::Output)?;
                            last_observed = committed.step;
                        }
                        None
                    }
                    Err(err) if err.is_recoverable() => {
                        warn!("Commit of step at t = {:e} failed: {}", time, err);
                        Some(DivergenceReason::NumericalDivergence)
                    }
                    Err(err) => return Err(err),
                }
            }
            NonlinearOutcome::Diverged(reason) => Some(reason),
        };

        if let Some(reason) = rejection {
            problem.discard_step();
            rejected_attempts += 1;
            match controller.on_diverged() {
                Ok(reduced) => warn!(
                    "Step at t = {:e} failed ({}), retrying with dt = {:e}",
                    time, reason, reduced
                ),
                Err(err) => {
                    error!(
                        "Step at t = {:e} failed ({}) and dt cannot be reduced further. \
                        Last committed step {} at t = {:e}",
                        time,
                        reason,
                        controller.step(),
                        controller.time()
                    );
                    return Err(err);
                }
            }
        }
    }

    if let Some(last) = last_committed.filter(|last| last.step != last_observed) {
        observer.observe(&last, problem).map_err(StepError::Output)?;
    }

    Ok(TransientSummary {
        steps: controller.step(),
        rejected_attempts,
        final_time: controller.time(),
        next_dt: controller.dt(),
    })
}
