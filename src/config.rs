//! Settings of a simulation run.
//!
//! All settings deserialize from partial documents; missing entries take their defaults.
use crate::assembly::AssemblyStrategy;
use crate::linear_solver::LinearSolverKind;
use crate::solver::LineSearchKind;
use crate::stepping::TimeSteppingSettings;
use multifem_optimize::newton::NewtonSettings;
use serde::{Deserialize, Serialize};

/// Tolerances and iteration limit of the Newton solver.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    pub max_iterations: usize,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    pub step_tolerance: f64,
    pub line_search: LineSearchKind,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        let NewtonSettings {
            max_iterations,
            absolute_tolerance,
            relative_tolerance,
            step_tolerance,
        } = NewtonSettings::default();
        Self {
            max_iterations,
            absolute_tolerance,
            relative_tolerance,
            step_tolerance,
            line_search: LineSearchKind::default(),
        }
    }
}

impl From<NewtonConfig> for NewtonSettings<f64> {
    fn from(config: NewtonConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            absolute_tolerance: config.absolute_tolerance,
            relative_tolerance: config.relative_tolerance,
            step_tolerance: config.step_tolerance,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblySettings {
    pub strategy: AssemblyStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub newton: NewtonConfig,
    pub time_stepping: TimeSteppingSettings,
    pub assembly: AssemblySettings,
    pub linear_solver: LinearSolverKind,
}
