//! Builder assembling a [`Manager`] from configuration and callables.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{GenSpec, RunConfig, SimSpec};
use crate::core::alloc::{Allocator, PersistentGenAllocator};
use crate::core::audit::InMemoryAuditSink;
use crate::core::callable::{GeneratorFactory, Simulator};
use crate::core::history::{History, RESERVED_FIELDS};
use crate::core::schema::Schema;
use crate::core::worker::WorkerId;
use crate::core::SchedulerError;
use crate::runtime::Manager;

/// Collects everything a run needs and validates it before building.
///
/// ```rust,ignore
/// let outcome = ManagerBuilder::new(RunConfig::new().with_workers(4).with_sim_max(100))
///     .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::Float)))
///     .sim_spec(SimSpec::new(["x"], Schema::new().with("f", FieldType::Float)))
///     .generator(|_worker| RandomSampler::default())
///     .simulator(Rosenbrock)
///     .build()?
///     .run()?;
/// ```
pub struct ManagerBuilder {
    config: RunConfig,
    gen_spec: Option<GenSpec>,
    sim_spec: Option<SimSpec>,
    simulator: Option<Arc<dyn Simulator>>,
    generators: Option<Arc<dyn GeneratorFactory>>,
    allocator: Option<Box<dyn Allocator>>,
    persis_info: BTreeMap<WorkerId, serde_json::Value>,
    audit_capacity: Option<usize>,
}

impl ManagerBuilder {
    /// Start from a run configuration.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            gen_spec: None,
            sim_spec: None,
            simulator: None,
            generators: None,
            allocator: None,
            persis_info: BTreeMap::new(),
            audit_capacity: None,
        }
    }

    /// Generator contract.
    #[must_use]
    pub fn gen_spec(mut self, spec: GenSpec) -> Self {
        self.gen_spec = Some(spec);
        self
    }

    /// Simulator contract.
    #[must_use]
    pub fn sim_spec(mut self, spec: SimSpec) -> Self {
        self.sim_spec = Some(spec);
        self
    }

    /// Simulator shared by all workers.
    #[must_use]
    pub fn simulator(mut self, simulator: impl Simulator) -> Self {
        self.simulator = Some(Arc::new(simulator));
        self
    }

    /// Factory for generator sessions.
    #[must_use]
    pub fn generator(mut self, factory: impl GeneratorFactory) -> Self {
        self.generators = Some(Arc::new(factory));
        self
    }

    /// Replace the default [`PersistentGenAllocator`].
    #[must_use]
    pub fn allocator(mut self, allocator: impl Allocator + 'static) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Initial persistent info for one worker.
    #[must_use]
    pub fn persis_info(mut self, worker_id: WorkerId, info: serde_json::Value) -> Self {
        self.persis_info.insert(worker_id, info);
        self
    }

    /// Keep the last `capacity` scheduler events in the run outcome.
    #[must_use]
    pub const fn audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = Some(capacity);
        self
    }

    /// Validate and assemble the manager.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Config`] for an invalid configuration or a missing
    ///   spec or callable.
    /// - [`SchedulerError::SchemaMismatch`] when the generator and simulator
    ///   schemas conflict or an input field names an unknown column.
    pub fn build(self) -> Result<Manager, SchedulerError> {
        self.config.validate().map_err(SchedulerError::Config)?;
        let gen_spec = self.gen_spec.ok_or_else(|| missing("gen_spec"))?;
        let sim_spec = self.sim_spec.ok_or_else(|| missing("sim_spec"))?;
        let simulator = self.simulator.ok_or_else(|| missing("simulator"))?;
        let generators = self.generators.ok_or_else(|| missing("generator"))?;

        let history = History::new(gen_spec.out.clone(), sim_spec.out.clone())?;
        check_fields(history.columns(), &sim_spec.inputs, "sim inputs")?;
        let gen_inputs = if gen_spec.persis_in.is_empty() {
            default_gen_inputs(&sim_spec.out)
        } else {
            gen_spec.persis_in
        };
        check_fields(history.columns(), &gen_inputs, "generator persis_in")?;

        let allocator = self.allocator.unwrap_or_else(|| {
            Box::new(PersistentGenAllocator::new(
                self.config.alloc.clone(),
                self.config.resources.unit_policy(),
                sim_spec.inputs,
                gen_inputs,
            ))
        });

        Ok(Manager {
            config: self.config,
            history,
            simulator,
            generators,
            allocator,
            persis_info: self.persis_info,
            audit: self.audit_capacity.map(InMemoryAuditSink::new),
        })
    }
}

impl std::fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("config", &self.config)
            .field("gen_spec", &self.gen_spec)
            .field("sim_spec", &self.sim_spec)
            .finish_non_exhaustive()
    }
}

fn missing(what: &str) -> SchedulerError {
    SchedulerError::Config(format!("{what} is required"))
}

/// `sim_id` plus every simulator output field.
fn default_gen_inputs(sim_out: &Schema) -> Vec<String> {
    std::iter::once("sim_id".to_string())
        .chain(sim_out.fields().iter().map(|(name, _)| name.clone()))
        .collect()
}

fn check_fields(columns: &Schema, fields: &[String], context: &str) -> Result<(), SchedulerError> {
    match fields
        .iter()
        .find(|f| columns.type_of(f).is_none() && !RESERVED_FIELDS.contains(&f.as_str()))
    {
        Some(field) => Err(SchedulerError::SchemaMismatch {
            context: context.into(),
            detail: format!("unknown field `{field}`"),
        }),
        None => Ok(()),
    }
}
