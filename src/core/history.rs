//! Append-only history of every generated point.
//!
//! The table is an arena of fixed-width records indexed by a dense id. It is
//! owned by the manager; other components only see `&HistoryRecord` or the
//! rows copied out by [`History::rows`]. Every mutation goes through a method
//! that checks the lifecycle invariants first and mutates only when the whole
//! request is valid:
//!
//! - ids are dense from 0 and never reused,
//! - `given` flips false→true once,
//! - `returned` flips false→true once, only after `given`,
//! - a cancel-requested row never takes a normal result; it is closed only by
//!   a cancellation acknowledgment.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::schema::{FieldValue, Row, Schema};
use crate::core::work::CalcStatus;
use crate::core::worker::WorkerId;
use crate::core::SchedulerError;

/// Dense, immutable identifier of a history row.
pub type HistoryId = usize;

/// Names that can be requested from [`History::rows`] besides user fields.
pub const RESERVED_FIELDS: &[&str] = &[
    "sim_id",
    "batch",
    "subbatch",
    "resource_sets",
    "gen_worker",
    "returned",
    "cancel_requested",
];

/// A point produced by a generator, before it gets an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPoint {
    /// Values for every field of the generator output schema.
    pub fields: Row,
    /// Batch tag.
    pub batch: i64,
    /// Sub-batch tag; points sharing one are dispatched together.
    pub subbatch: i64,
    /// Resource units this point's evaluation needs, if it overrides the default.
    pub resource_sets: Option<u32>,
}

impl NewPoint {
    /// Point with the given fields and zeroed tags.
    #[must_use]
    pub fn new(fields: Row) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Set batch and sub-batch tags.
    #[must_use]
    pub const fn tagged(mut self, batch: i64, subbatch: i64) -> Self {
        self.batch = batch;
        self.subbatch = subbatch;
        self
    }

    /// Set the resource request.
    #[must_use]
    pub const fn with_resource_sets(mut self, units: u32) -> Self {
        self.resource_sets = Some(units);
        self
    }
}

/// One row of the history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Row id.
    pub sim_id: HistoryId,
    /// Column values, in the order of [`History::columns`].
    values: Vec<FieldValue>,
    /// Dispatched to a simulator.
    pub given: bool,
    /// When it was dispatched (seconds since epoch).
    pub given_time: Option<f64>,
    /// A simulator outcome has been merged.
    pub returned: bool,
    /// When the outcome was merged.
    pub returned_time: Option<f64>,
    /// When the generator output containing this point was merged.
    pub gen_time: f64,
    /// Worker whose generator produced the point.
    pub gen_worker: WorkerId,
    /// Worker evaluating or having evaluated the point (0 = none).
    pub sim_worker: WorkerId,
    /// The in-flight evaluation should be abandoned.
    pub cancel_requested: bool,
    /// Batch tag.
    pub batch: i64,
    /// Sub-batch tag.
    pub subbatch: i64,
    /// Per-point resource request.
    pub resource_sets: Option<u32>,
    /// Outcome recorded when `returned` was set.
    pub calc_status: Option<CalcStatus>,
}

impl HistoryRecord {
    /// Evaluated with a normal result, or closed as cancelled/failed.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.returned || (self.cancel_requested && !self.given)
    }

    /// Waiting to be dispatched.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        !self.given && !self.cancel_requested
    }

    /// Dispatched and not yet returned.
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        self.given && !self.returned
    }
}

/// Which ids a merge closed, by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Ids whose outputs were written.
    pub evaluated: Vec<HistoryId>,
    /// Ids closed by a cancellation acknowledgment.
    pub cancelled: Vec<HistoryId>,
    /// Ids closed as failed.
    pub failed: Vec<HistoryId>,
}

/// The append-only history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    gen_out: Schema,
    sim_out: Schema,
    columns: Schema,
    records: Vec<HistoryRecord>,
    given_count: usize,
    returned_count: usize,
}

impl History {
    /// Empty history for a run with the given generator/simulator outputs.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SchemaMismatch`] when the two schemas declare
    /// one field with different types.
    pub fn new(gen_out: Schema, sim_out: Schema) -> Result<Self, SchedulerError> {
        let columns = gen_out.union(&sim_out)?;
        Ok(Self {
            gen_out,
            sim_out,
            columns,
            records: Vec::new(),
            given_count: 0,
            returned_count: 0,
        })
    }

    /// All user columns.
    #[must_use]
    pub const fn columns(&self) -> &Schema {
        &self.columns
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no point has been generated yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows with `given = true`.
    #[must_use]
    pub const fn given_count(&self) -> usize {
        self.given_count
    }

    /// Rows with `returned = true`.
    #[must_use]
    pub const fn returned_count(&self) -> usize {
        self.returned_count
    }

    /// Read-only access to a row.
    #[must_use]
    pub fn record(&self, id: HistoryId) -> Option<&HistoryRecord> {
        self.records.get(id)
    }

    /// All rows in id order.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    /// Rows produced by `worker`'s generator, in id order.
    pub fn generated_by(&self, worker: WorkerId) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter().filter(move |r| r.gen_worker == worker)
    }

    /// Ids waiting for dispatch (`given = false AND cancel_requested = false`).
    pub fn pending_ids(&self) -> impl Iterator<Item = HistoryId> + '_ {
        self.records.iter().filter(|r| r.is_pending()).map(|r| r.sim_id)
    }

    /// Value of user field `name` on row `id`.
    #[must_use]
    pub fn field(&self, id: HistoryId, name: &str) -> Option<&FieldValue> {
        let col = self.columns.fields().iter().position(|(n, _)| n == name)?;
        self.records.get(id).and_then(|r| r.values.get(col))
    }

    /// Append generator output. Returns the id range of the new rows.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SchemaMismatch`] if any point does not carry
    /// exactly the generator output fields; nothing is appended in that case.
    pub fn append_points(
        &mut self,
        gen_worker: WorkerId,
        points: Vec<NewPoint>,
        now: f64,
    ) -> Result<Range<HistoryId>, SchedulerError> {
        let context = format!("gen output of worker {gen_worker}");
        for point in &points {
            self.gen_out.check_row(&point.fields, &context)?;
        }

        let start = self.records.len();
        for (offset, mut point) in points.into_iter().enumerate() {
            let values = self
                .columns
                .fields()
                .iter()
                .map(|(name, ty)| point.fields.remove(name).unwrap_or_else(|| ty.zero()))
                .collect();
            self.records.push(HistoryRecord {
                sim_id: start + offset,
                values,
                given: false,
                given_time: None,
                returned: false,
                returned_time: None,
                gen_time: now,
                gen_worker,
                sim_worker: 0,
                cancel_requested: false,
                batch: point.batch,
                subbatch: point.subbatch,
                resource_sets: point.resource_sets,
                calc_status: None,
            });
        }
        Ok(start..self.records.len())
    }

    /// Mark `ids` as dispatched to `sim_worker`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvariantViolation`] if any id is unknown,
    /// already given, or cancel-requested. No row is modified in that case.
    pub fn mark_given(
        &mut self,
        ids: &[HistoryId],
        sim_worker: WorkerId,
        now: f64,
    ) -> Result<(), SchedulerError> {
        ensure_distinct(ids)?;
        for &id in ids {
            let record = self.get(id)?;
            if record.given {
                return Err(SchedulerError::InvariantViolation(format!(
                    "point {id} already given to worker {}",
                    record.sim_worker
                )));
            }
            if record.cancel_requested {
                return Err(SchedulerError::InvariantViolation(format!(
                    "point {id} is cancel-requested and cannot be dispatched"
                )));
            }
        }
        for &id in ids {
            let record = &mut self.records[id];
            record.given = true;
            record.given_time = Some(now);
            record.sim_worker = sim_worker;
        }
        self.given_count += ids.len();
        Ok(())
    }

    /// Merge a simulator outcome for `ids`.
    ///
    /// `rows` must hold one sim-output row per id when `status` is
    /// [`CalcStatus::Success`]. Cancel-requested rows discard their outputs
    /// and are closed as cancelled.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvariantViolation`] if an id is unknown, was not
    ///   given to `worker`, or has already returned (duplicate merge).
    /// - [`SchedulerError::SchemaMismatch`] if the rows do not match the
    ///   simulator output schema.
    pub fn merge_results(
        &mut self,
        worker: WorkerId,
        ids: &[HistoryId],
        rows: &[Row],
        status: CalcStatus,
        now: f64,
    ) -> Result<MergeSummary, SchedulerError> {
        if ids.is_empty() {
            return Err(SchedulerError::InvariantViolation(format!(
                "worker {worker} returned a result without history ids"
            )));
        }
        ensure_distinct(ids)?;
        for &id in ids {
            let record = self.get(id)?;
            if !record.given || record.sim_worker != worker {
                return Err(SchedulerError::InvariantViolation(format!(
                    "point {id} was not dispatched to worker {worker}"
                )));
            }
            if record.returned {
                return Err(SchedulerError::InvariantViolation(format!(
                    "duplicate merge: point {id} already returned"
                )));
            }
        }
        if status == CalcStatus::Success {
            if rows.len() != ids.len() {
                return Err(SchedulerError::SchemaMismatch {
                    context: format!("sim output of worker {worker}"),
                    detail: format!("{} rows for {} points", rows.len(), ids.len()),
                });
            }
            let context = format!("sim output of worker {worker}");
            for row in rows {
                self.sim_out.check_row(row, &context)?;
            }
        }

        let mut summary = MergeSummary::default();
        for (i, &id) in ids.iter().enumerate() {
            let cancel_requested = self.records[id].cancel_requested;
            let outcome = match status {
                CalcStatus::Success if cancel_requested => CalcStatus::Cancelled,
                CalcStatus::Success => {
                    self.write_row(id, &rows[i]);
                    CalcStatus::Success
                }
                other => other,
            };
            match outcome {
                CalcStatus::Success => summary.evaluated.push(id),
                CalcStatus::Cancelled => summary.cancelled.push(id),
                CalcStatus::Failed => summary.failed.push(id),
            }
            let record = &mut self.records[id];
            record.returned = true;
            record.returned_time = Some(now);
            record.calc_status = Some(outcome);
        }
        self.returned_count += ids.len();
        Ok(summary)
    }

    /// Flag `ids` for cancellation. Returns the ones currently in flight,
    /// whose workers must be told to abandon them. Already returned rows are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvariantViolation`] for unknown ids.
    pub fn request_cancel(&mut self, ids: &[HistoryId]) -> Result<Vec<HistoryId>, SchedulerError> {
        for &id in ids {
            self.get(id)?;
        }
        let mut in_flight = Vec::new();
        for &id in ids {
            let record = &mut self.records[id];
            if record.returned || record.cancel_requested {
                continue;
            }
            record.cancel_requested = true;
            if record.given {
                in_flight.push(id);
            }
        }
        Ok(in_flight)
    }

    /// Copy `fields` of rows `ids` out of the table, preserving id order.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvariantViolation`] for unknown ids and
    /// [`SchedulerError::SchemaMismatch`] for unknown field names.
    pub fn rows(&self, ids: &[HistoryId], fields: &[String]) -> Result<Vec<Row>, SchedulerError> {
        let mut cols = Vec::with_capacity(fields.len());
        for name in fields {
            let col = self.columns.fields().iter().position(|(n, _)| n == name);
            if col.is_none() && !RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(SchedulerError::SchemaMismatch {
                    context: "input field selection".into(),
                    detail: format!("unknown field `{name}`"),
                });
            }
            cols.push((name, col));
        }

        ids.iter()
            .map(|&id| {
                let record = self.get(id)?;
                Ok(cols
                    .iter()
                    .map(|(name, col)| {
                        let value = col.map_or_else(
                            || reserved_value(record, name),
                            |c| record.values[c].clone(),
                        );
                        ((*name).clone(), value)
                    })
                    .collect())
            })
            .collect()
    }

    fn get(&self, id: HistoryId) -> Result<&HistoryRecord, SchedulerError> {
        self.records.get(id).ok_or_else(|| {
            SchedulerError::InvariantViolation(format!(
                "unknown history id {id} (history has {} rows)",
                self.records.len()
            ))
        })
    }

    fn write_row(&mut self, id: HistoryId, row: &Row) {
        for (col, (name, _)) in self.columns.fields().iter().enumerate() {
            if let Some(value) = row.get(name) {
                self.records[id].values[col] = value.clone();
            }
        }
    }
}

fn ensure_distinct(ids: &[HistoryId]) -> Result<(), SchedulerError> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    match sorted.windows(2).find(|w| w[0] == w[1]) {
        Some(w) => Err(SchedulerError::InvariantViolation(format!(
            "history id {} listed twice in one request",
            w[0]
        ))),
        None => Ok(()),
    }
}

fn reserved_value(record: &HistoryRecord, name: &str) -> FieldValue {
    let as_int = |v: usize| FieldValue::Int(i64::try_from(v).unwrap_or(i64::MAX));
    match name {
        "sim_id" => as_int(record.sim_id),
        "batch" => FieldValue::Int(record.batch),
        "subbatch" => FieldValue::Int(record.subbatch),
        "resource_sets" => FieldValue::Int(i64::from(record.resource_sets.unwrap_or(0))),
        "gen_worker" => as_int(record.gen_worker),
        "returned" => FieldValue::Bool(record.returned),
        _ => FieldValue::Bool(record.cancel_requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::FieldType;

    fn history() -> History {
        History::new(
            Schema::new().with("x", FieldType::Float),
            Schema::new().with("f", FieldType::Float),
        )
        .unwrap()
    }

    fn point(x: f64, subbatch: i64) -> NewPoint {
        let mut fields = Row::new();
        fields.insert("x".into(), FieldValue::Float(x));
        NewPoint::new(fields).tagged(0, subbatch)
    }

    fn f_row(f: f64) -> Row {
        let mut row = Row::new();
        row.insert("f".into(), FieldValue::Float(f));
        row
    }

    #[test]
    fn test_ids_are_dense() {
        let mut h = history();
        assert_eq!(h.append_points(1, vec![point(0.1, 0), point(0.2, 0)], 1.0).unwrap(), 0..2);
        assert_eq!(h.append_points(1, vec![point(0.3, 1)], 2.0).unwrap(), 2..3);
        assert_eq!(h.pending_ids().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(h.field(2, "x"), Some(&FieldValue::Float(0.3)));
        assert_eq!(h.field(2, "f"), Some(&FieldValue::Float(0.0)));
    }

    #[test]
    fn test_given_is_set_once() {
        let mut h = history();
        h.append_points(1, vec![point(0.1, 0)], 0.0).unwrap();
        h.mark_given(&[0], 2, 1.0).unwrap();
        assert!(matches!(
            h.mark_given(&[0], 3, 2.0),
            Err(SchedulerError::InvariantViolation(_))
        ));
        assert_eq!(h.record(0).unwrap().sim_worker, 2);
        assert_eq!(h.given_count(), 1);
    }

    #[test]
    fn test_merge_requires_given_and_rejects_duplicates() {
        let mut h = history();
        h.append_points(1, vec![point(0.1, 0)], 0.0).unwrap();
        assert!(h.merge_results(2, &[0], &[f_row(1.0)], CalcStatus::Success, 1.0).is_err());

        h.mark_given(&[0], 2, 1.0).unwrap();
        let summary = h.merge_results(2, &[0], &[f_row(1.0)], CalcStatus::Success, 2.0).unwrap();
        assert_eq!(summary.evaluated, vec![0]);
        assert_eq!(h.field(0, "f"), Some(&FieldValue::Float(1.0)));

        let dup = h.merge_results(2, &[0], &[f_row(9.0)], CalcStatus::Success, 3.0);
        assert!(matches!(dup, Err(SchedulerError::InvariantViolation(_))));
        assert_eq!(h.field(0, "f"), Some(&FieldValue::Float(1.0)));
        assert_eq!(h.returned_count(), 1);
    }

    #[test]
    fn test_success_after_cancel_is_not_merged() {
        let mut h = history();
        h.append_points(1, vec![point(0.1, 0), point(0.2, 0)], 0.0).unwrap();
        h.mark_given(&[0], 2, 1.0).unwrap();
        assert_eq!(h.request_cancel(&[0, 1]).unwrap(), vec![0]);
        assert_eq!(h.pending_ids().count(), 0);

        let summary = h.merge_results(2, &[0], &[f_row(5.0)], CalcStatus::Success, 2.0).unwrap();
        assert_eq!(summary.cancelled, vec![0]);
        let record = h.record(0).unwrap();
        assert_eq!(record.calc_status, Some(CalcStatus::Cancelled));
        assert_eq!(h.field(0, "f"), Some(&FieldValue::Float(0.0)));
        assert!(h.record(1).unwrap().is_resolved());
    }

    #[test]
    fn test_schema_mismatch_leaves_rows_untouched() {
        let mut h = history();
        let mut bad = Row::new();
        bad.insert("y".into(), FieldValue::Float(1.0));
        assert!(h.append_points(1, vec![point(0.1, 0), NewPoint::new(bad)], 0.0).is_err());
        assert!(h.is_empty());

        h.append_points(1, vec![point(0.1, 0)], 0.0).unwrap();
        h.mark_given(&[0], 2, 1.0).unwrap();
        let mut wrong = Row::new();
        wrong.insert("f".into(), FieldValue::Int(1));
        assert!(matches!(
            h.merge_results(2, &[0], &[wrong], CalcStatus::Success, 2.0),
            Err(SchedulerError::SchemaMismatch { .. })
        ));
        assert!(!h.record(0).unwrap().returned);
    }

    #[test]
    fn test_rows_include_reserved_fields() {
        let mut h = history();
        h.append_points(4, vec![point(0.5, 3)], 0.0).unwrap();
        let rows = h.rows(&[0], &["sim_id".into(), "x".into(), "subbatch".into()]).unwrap();
        assert_eq!(rows[0]["sim_id"], FieldValue::Int(0));
        assert_eq!(rows[0]["x"], FieldValue::Float(0.5));
        assert_eq!(rows[0]["subbatch"], FieldValue::Int(3));
        assert!(h.rows(&[0], &["nope".into()]).is_err());
    }
}
