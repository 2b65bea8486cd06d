//! Reconciliation of stored reference counts against an external census.
//!
//! Owners that keep object ids in their own tables can drift from the
//! engine's bookkeeping. They enumerate the ids they actually hold into a
//! [`Census`], and the [`Reconciler`] treats that census as ground truth:
//! records nobody references are deleted, and any other count that
//! disagrees is overwritten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::BlobStore;
use crate::engine::DedupEngine;
use crate::error::{Error, Result};
use crate::record::{ObjectId, ObjectRecord};

/// Externally observed reference counts. Ids not listed count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Census(BTreeMap<ObjectId, u64>);

impl Census {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count each occurrence of an id as one reference.
    pub fn tally<I: IntoIterator<Item = ObjectId>>(ids: I) -> Self {
        let mut census = Self::new();
        for id in ids {
            census.add(id);
        }
        census
    }

    /// Parse `{"<id>": <count>, ...}`.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn add(&mut self, id: ObjectId) {
        *self.0.entry(id).or_insert(0) += 1;
    }

    pub fn set(&mut self, id: ObjectId, count: u64) {
        self.0.insert(id, count);
    }

    pub fn count(&self, id: ObjectId) -> u64 {
        self.0.get(&id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ObjectId, u64)> for Census {
    fn from_iter<T: IntoIterator<Item = (ObjectId, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One decision taken (or, when simulating, intended) for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Unreferenced and confirmed for deletion.
    Delete { id: ObjectId },
    /// Unreferenced, but deletion was declined.
    Keep { id: ObjectId },
    /// Stored count corrected to the census.
    Update { id: ObjectId, from: u64, to: u64 },
}

impl ReconcileAction {
    pub fn id(&self) -> ObjectId {
        match self {
            ReconcileAction::Delete { id }
            | ReconcileAction::Keep { id }
            | ReconcileAction::Update { id, .. } => *id,
        }
    }
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub simulated: bool,
    pub processed: u64,
    pub deleted: u64,
    pub kept: u64,
    pub updated: u64,
    pub actions: Vec<ReconcileAction>,
}

impl ReconcileReport {
    fn record(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::Delete { .. } => self.deleted += 1,
            ReconcileAction::Keep { .. } => self.kept += 1,
            ReconcileAction::Update { .. } => self.updated += 1,
        }
        self.actions.push(action);
    }
}

/// Applies a census to an engine.
#[derive(Debug)]
pub struct Reconciler<'e, B> {
    engine: &'e DedupEngine<B>,
}

impl<'e, B: BlobStore> Reconciler<'e, B> {
    pub fn new(engine: &'e DedupEngine<B>) -> Self {
        Self { engine }
    }

    /// Reconcile, deleting every unreferenced record without asking.
    pub fn reconcile(&self, census: &Census, simulate: bool) -> Result<ReconcileReport> {
        self.reconcile_with(census, simulate, |_| true)
    }

    /// Reconcile, asking `confirm` before each deletion.
    ///
    /// With `simulate` nothing is changed; the report lists what would have
    /// happened. `confirm` is still consulted so interactive callers see the
    /// same prompts either way.
    pub fn reconcile_with<F>(&self, census: &Census, simulate: bool, mut confirm: F) -> Result<ReconcileReport>
    where
        F: FnMut(&ObjectRecord) -> bool,
    {
        let mut report = ReconcileReport {
            simulated: simulate,
            ..ReconcileReport::default()
        };

        for record in self.engine.list()? {
            report.processed += 1;
            let observed = census.count(record.id);

            let action = if observed == 0 {
                if confirm(&record) {
                    ReconcileAction::Delete { id: record.id }
                } else {
                    ReconcileAction::Keep { id: record.id }
                }
            } else if observed != record.reference_count {
                ReconcileAction::Update {
                    id: record.id,
                    from: record.reference_count,
                    to: observed,
                }
            } else {
                continue;
            };

            if !simulate {
                self.apply(action)?;
            }
            report.record(action);
        }

        info!(
            simulated = simulate,
            processed = report.processed,
            deleted = report.deleted,
            kept = report.kept,
            updated = report.updated,
            "reconciliation finished"
        );
        Ok(report)
    }

    fn apply(&self, action: ReconcileAction) -> Result<()> {
        match action {
            ReconcileAction::Delete { id } => match self.engine.purge(id) {
                Ok(_) => {}
                Err(Error::NotFound(_)) => debug!(id = %id, "already deleted"),
                Err(e) => return Err(e),
            },
            ReconcileAction::Keep { id } => debug!(id = %id, "keeping unreferenced object"),
            ReconcileAction::Update { id, from, to } => {
                if self.engine.index().set_reference_count(id, to)?.is_some() {
                    info!(id = %id, from, to, "corrected reference count");
                }
            }
        }
        Ok(())
    }
}
