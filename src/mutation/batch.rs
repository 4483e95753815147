//! Fan a mutation out over many ids with independent failure.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::coordinator::{MutationCoordinator, Operation};
use crate::error::SyncError;

/// An operation that can be addressed to one item of a batch.
pub trait ItemOperation: Operation {
  /// Parameters shared by every item, e.g. the review decision.
  type Params: Send + Sync;

  fn item_input(&self, id: &str, params: &Self::Params) -> Self::Input;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
  pub id: String,
  pub status: ItemStatus,
  pub error: Option<SyncError>,
}

/// Aggregate result of a batch, reported after every item has settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
  pub total: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub per_item: Vec<ItemOutcome>,
}

impl BatchOutcome {
  pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
    self.per_item.iter().filter(|i| i.status == ItemStatus::Error)
  }
}

/// Runs one mutation per id through a shared [`MutationCoordinator`].
#[derive(Clone)]
pub struct BatchRunner {
  coordinator: MutationCoordinator,
}

impl BatchRunner {
  pub fn new(coordinator: MutationCoordinator) -> Self {
    Self { coordinator }
  }

  /// Apply `op` to every id.
  ///
  /// All optimistic edits are applied before any call is issued. Items run
  /// concurrently and fail independently; failed items are rolled back on
  /// their own. Dependent scopes are invalidated once, for the whole batch.
  pub async fn batch_mutate<O: ItemOperation>(
    &self,
    op: &Arc<O>,
    ids: &[String],
    params: O::Params,
  ) -> BatchOutcome {
    let runs: Vec<_> = ids
      .iter()
      .map(|id| self.coordinator.start(op, op.item_input(id, &params)))
      .collect();

    let results = futures::future::join_all(runs).await;

    let mut scopes = BTreeSet::new();
    let mut per_item = Vec::with_capacity(ids.len());
    for (id, (result, dependents)) in ids.iter().zip(results) {
      scopes.extend(dependents);
      per_item.push(match result {
        Ok(_) => ItemOutcome {
          id: id.clone(),
          status: ItemStatus::Success,
          error: None,
        },
        Err(err) => ItemOutcome {
          id: id.clone(),
          status: ItemStatus::Error,
          error: Some(err),
        },
      });
    }

    if !scopes.is_empty() {
      let scopes: Vec<_> = scopes.into_iter().collect();
      self.coordinator.cache().invalidate_many(&scopes);
    }

    let succeeded = per_item
      .iter()
      .filter(|i| i.status == ItemStatus::Success)
      .count();
    let outcome = BatchOutcome {
      total: per_item.len(),
      succeeded,
      failed: per_item.len() - succeeded,
      per_item,
    };
    info!(
      name = op.name(),
      total = outcome.total,
      succeeded = outcome.succeeded,
      failed = outcome.failed,
      "batch settled"
    );
    outcome
  }
}
