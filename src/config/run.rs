//! Run configuration: workers, resources, allocation policy and exit criteria.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::alloc::{AllocConfig, UnitPolicy};
use crate::core::schema::Schema;

/// Default stack size for worker threads.
pub const DEFAULT_WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Resource descriptor for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Size of the run's resource pool.
    pub total_units: u32,
    /// Units for a point that does not set `resource_sets`; 0 reserves nothing.
    pub default_units_per_point: u32,
    /// Units held by each generator session.
    pub gen_units: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            total_units: u32::try_from(num_cpus::get()).unwrap_or(1),
            default_units_per_point: 0,
            gen_units: 0,
        }
    }
}

impl ResourceConfig {
    /// Per-assignment unit requests derived from this descriptor.
    #[must_use]
    pub const fn unit_policy(&self) -> UnitPolicy {
        UnitPolicy {
            default_units_per_point: self.default_units_per_point,
            gen_units: self.gen_units,
        }
    }
}

/// When a run stops. At least one criterion must be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitCriteria {
    /// Stop after this many points have returned.
    pub sim_max: Option<usize>,
    /// Stop once the history holds this many points.
    pub gen_max: Option<usize>,
    /// Stop after this much wall-clock time.
    pub wallclock_max_secs: Option<f64>,
}

impl ExitCriteria {
    fn is_empty(&self) -> bool {
        self.sim_max.is_none() && self.gen_max.is_none() && self.wallclock_max_secs.is_none()
    }
}

/// Root run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of worker threads.
    pub nworkers: usize,
    /// Resource pool descriptor.
    pub resources: ResourceConfig,
    /// Allocation policy.
    pub alloc: AllocConfig,
    /// Exit criteria.
    pub exit_criteria: ExitCriteria,
    /// Abort the run when a callable fails; otherwise mark the points failed
    /// and carry on.
    pub abort_on_exception: bool,
    /// Consecutive ticks with nothing assigned and nothing running before
    /// the run is declared stalled.
    pub stall_grace_ticks: u32,
    /// How long the manager waits for a worker message per loop iteration.
    pub result_poll_ms: u64,
    /// How long in-flight work may take to come back once the run ends.
    pub drain_timeout_secs: u64,
    /// Stack size of worker threads.
    pub worker_stack_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nworkers: num_cpus::get(),
            resources: ResourceConfig::default(),
            alloc: AllocConfig::default(),
            exit_criteria: ExitCriteria::default(),
            abort_on_exception: true,
            stall_grace_ticks: 1,
            result_poll_ms: 50,
            drain_timeout_secs: 30,
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
        }
    }
}

impl RunConfig {
    /// Defaults with no exit criterion; set one before validating.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn with_workers(mut self, nworkers: usize) -> Self {
        self.nworkers = nworkers;
        self
    }

    /// Set the resource descriptor.
    #[must_use]
    pub const fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    /// Set the allocation policy.
    #[must_use]
    pub const fn with_alloc(mut self, alloc: AllocConfig) -> Self {
        self.alloc = alloc;
        self
    }

    /// Stop after `sim_max` returned points.
    #[must_use]
    pub const fn with_sim_max(mut self, sim_max: usize) -> Self {
        self.exit_criteria.sim_max = Some(sim_max);
        self
    }

    /// Stop once `gen_max` points exist.
    #[must_use]
    pub const fn with_gen_max(mut self, gen_max: usize) -> Self {
        self.exit_criteria.gen_max = Some(gen_max);
        self
    }

    /// Stop after `secs` seconds.
    #[must_use]
    pub const fn with_wallclock_max(mut self, secs: f64) -> Self {
        self.exit_criteria.wallclock_max_secs = Some(secs);
        self
    }

    /// Choose between aborting and continuing on callable failures.
    #[must_use]
    pub const fn with_abort_on_exception(mut self, abort: bool) -> Self {
        self.abort_on_exception = abort;
        self
    }

    /// Set the manager's per-iteration result wait.
    #[must_use]
    pub const fn with_result_poll_ms(mut self, ms: u64) -> Self {
        self.result_poll_ms = ms;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout_secs(mut self, secs: u64) -> Self {
        self.drain_timeout_secs = secs;
        self
    }

    /// Result poll interval as a duration.
    #[must_use]
    pub const fn result_poll(&self) -> Duration {
        Duration::from_millis(self.result_poll_ms)
    }

    /// Drain timeout as a duration.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.nworkers == 0 {
            return Err("nworkers must be greater than 0".into());
        }
        if self.exit_criteria.is_empty() {
            return Err("at least one exit criterion (sim_max, gen_max, wallclock_max_secs) must be set".into());
        }
        if self.exit_criteria.wallclock_max_secs.is_some_and(|s| !(s > 0.0)) {
            return Err("wallclock_max_secs must be positive".into());
        }
        if self.resources.gen_units > self.resources.total_units {
            return Err(format!(
                "gen_units ({}) exceeds total_units ({})",
                self.resources.gen_units, self.resources.total_units
            ));
        }
        if self.resources.default_units_per_point > self.resources.total_units {
            return Err(format!(
                "default_units_per_point ({}) exceeds total_units ({})",
                self.resources.default_units_per_point, self.resources.total_units
            ));
        }
        if self.alloc.max_persistent_gens >= self.nworkers {
            return Err(format!(
                "max_persistent_gens ({}) leaves no simulator worker out of {}",
                self.alloc.max_persistent_gens, self.nworkers
            ));
        }
        if self.worker_stack_size == 0 {
            return Err("worker_stack_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse run configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `ENSEMBLE_*` environment overrides, loading a `.env` file first
    /// when one exists.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        let _ = dotenvy::dotenv();
        if let Some(n) = env_var("ENSEMBLE_NWORKERS")? {
            self.nworkers = n;
        }
        if let Some(n) = env_var("ENSEMBLE_TOTAL_UNITS")? {
            self.resources.total_units = n;
        }
        if let Some(n) = env_var("ENSEMBLE_SIM_MAX")? {
            self.exit_criteria.sim_max = Some(n);
        }
        Ok(())
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{name}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Generator-side contract of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenSpec {
    /// Fields every generated point carries.
    pub out: Schema,
    /// Fields shipped back to a persistent generator with a completed group.
    pub persis_in: Vec<String>,
}

impl GenSpec {
    /// Generator producing `out`.
    #[must_use]
    pub fn new(out: Schema) -> Self {
        Self {
            out,
            persis_in: Vec::new(),
        }
    }

    /// Fields fed back on continuation.
    #[must_use]
    pub fn with_persis_in<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.persis_in = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Simulator-side contract of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSpec {
    /// Fields shipped with each dispatched point.
    pub inputs: Vec<String>,
    /// Fields every evaluation returns.
    pub out: Schema,
}

impl SimSpec {
    /// Simulator reading `inputs` and producing `out`.
    #[must_use]
    pub fn new<I, S>(inputs: I, out: Schema) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            out,
        }
    }
}
