//! Compliance API with transparent caching, optimistic reviews and job
//! polling.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::client::ComplianceClient;
use super::keys::{ComplianceQuery, Domain};
use super::operations::{
  AssignCase, AssignInput, ResolveCase, ResolveInput, ReviewApplicant, ReviewInput,
};
use super::types::{
  Applicant, ApplicantFilter, Case, CaseFilter, Decision, Document, Job, ListPage,
  ScreeningResult,
};
use crate::cache::{QueryCache, Subscription};
use crate::error::SyncError;
use crate::mutation::{BatchOutcome, BatchRunner, MutationCoordinator};
use crate::poller::{PollHandle, Poller};

/// Polling cadence per kind of long-running work.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
  pub jobs: Duration,
  pub documents: Duration,
}

impl Default for PollIntervals {
  fn default() -> Self {
    Self {
      jobs: Duration::from_secs(2),
      documents: Duration::from_secs(5),
    }
  }
}

/// Compliance client with transparent caching support.
///
/// Reads go through the query cache, writes through the mutation
/// coordinator, so every view of the same resource stays consistent.
#[derive(Clone)]
pub struct ComplianceSync {
  client: ComplianceClient,
  cache: QueryCache,
  coordinator: MutationCoordinator,
  batches: BatchRunner,
  review: Arc<ReviewApplicant>,
  resolve: Arc<ResolveCase>,
  assign: Arc<AssignCase>,
  intervals: PollIntervals,
}

impl ComplianceSync {
  pub fn new(client: ComplianceClient, cache: QueryCache, intervals: PollIntervals) -> Self {
    let coordinator = MutationCoordinator::new(cache.clone());
    Self {
      review: Arc::new(ReviewApplicant::new(client.clone())),
      resolve: Arc::new(ResolveCase::new(client.clone())),
      assign: Arc::new(AssignCase::new(client.clone())),
      batches: BatchRunner::new(coordinator.clone()),
      coordinator,
      client,
      cache,
      intervals,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn coordinator(&self) -> &MutationCoordinator {
    &self.coordinator
  }

  /// List applicants. Each listed applicant also seeds its detail entry.
  pub async fn applicants(&self, filter: &ApplicantFilter) -> Result<ListPage<Applicant>, SyncError> {
    let key = ComplianceQuery::Applicants(filter.clone()).key();
    let client = self.client.clone();
    let cache = self.cache.clone();
    let filter = filter.clone();
    self
      .cache
      .fetch(&key, move |signal| async move {
        let page = client.list_applicants(&filter, &signal).await?;
        for applicant in &page.items {
          cache.write(&Domain::Applicants.detail(&applicant.id), applicant)?;
        }
        debug!(count = page.items.len(), total = page.total, "seeded applicant details");
        Ok::<_, SyncError>(page)
      })
      .await
  }

  pub async fn applicant(&self, id: &str) -> Result<Applicant, SyncError> {
    let key = ComplianceQuery::Applicant { id: id.to_string() }.key();
    let client = self.client.clone();
    let id = id.to_string();
    self
      .cache
      .fetch(&key, move |signal| async move { client.get_applicant(&id, &signal).await })
      .await
  }

  /// Keep an applicant's entry live; it refetches whenever invalidated.
  pub fn watch_applicant(&self, id: &str) -> Subscription {
    let key = ComplianceQuery::Applicant { id: id.to_string() }.key();
    let client = self.client.clone();
    let id = id.to_string();
    self.cache.subscribe(&key, move |signal| {
      let client = client.clone();
      let id = id.clone();
      async move { client.get_applicant(&id, &signal).await }
    })
  }

  pub async fn cases(&self, filter: &CaseFilter) -> Result<ListPage<Case>, SyncError> {
    let key = ComplianceQuery::Cases(filter.clone()).key();
    let client = self.client.clone();
    let cache = self.cache.clone();
    let filter = filter.clone();
    self
      .cache
      .fetch(&key, move |signal| async move {
        let page = client.list_cases(&filter, &signal).await?;
        for case in &page.items {
          cache.write(&Domain::Cases.detail(&case.id), case)?;
        }
        Ok::<_, SyncError>(page)
      })
      .await
  }

  pub async fn case(&self, id: &str) -> Result<Case, SyncError> {
    let key = ComplianceQuery::Case { id: id.to_string() }.key();
    let client = self.client.clone();
    let id = id.to_string();
    self
      .cache
      .fetch(&key, move |signal| async move { client.get_case(&id, &signal).await })
      .await
  }

  pub async fn documents(&self, applicant_id: &str) -> Result<ListPage<Document>, SyncError> {
    let key = ComplianceQuery::ApplicantDocuments {
      applicant_id: applicant_id.to_string(),
    }
    .key();
    let client = self.client.clone();
    let applicant_id = applicant_id.to_string();
    self
      .cache
      .fetch(&key, move |signal| async move {
        client.list_documents(&applicant_id, &signal).await
      })
      .await
  }

  pub async fn screening(&self, applicant_id: &str) -> Result<ScreeningResult, SyncError> {
    let key = ComplianceQuery::Screening {
      applicant_id: applicant_id.to_string(),
    }
    .key();
    let client = self.client.clone();
    let applicant_id = applicant_id.to_string();
    self
      .cache
      .fetch(&key, move |signal| async move {
        client.get_screening(&applicant_id, &signal).await
      })
      .await
  }

  /// Record a review decision, showing it immediately.
  pub async fn review(
    &self,
    applicant_id: &str,
    decision: Decision,
    notes: Option<String>,
  ) -> Result<Applicant, SyncError> {
    let input = ReviewInput {
      applicant_id: applicant_id.to_string(),
      decision,
      notes,
    };
    self.coordinator.mutate(&self.review, input).await
  }

  /// Apply one decision to many applicants; failures are reported per item.
  pub async fn bulk_review(&self, applicant_ids: &[String], decision: Decision) -> BatchOutcome {
    self
      .batches
      .batch_mutate(&self.review, applicant_ids, decision)
      .await
  }

  pub async fn resolve_case(&self, case_id: &str, resolution: &str) -> Result<Case, SyncError> {
    let input = ResolveInput {
      case_id: case_id.to_string(),
      resolution: resolution.to_string(),
    };
    self.coordinator.mutate(&self.resolve, input).await
  }

  pub async fn bulk_resolve(&self, case_ids: &[String], resolution: &str) -> BatchOutcome {
    self
      .batches
      .batch_mutate(&self.resolve, case_ids, resolution.to_string())
      .await
  }

  pub async fn assign_case(&self, case_id: &str, assignee: &str) -> Result<Case, SyncError> {
    let input = AssignInput {
      case_id: case_id.to_string(),
      assignee: assignee.to_string(),
    };
    self.coordinator.mutate(&self.assign, input).await
  }

  /// Poll a job until it completes or fails.
  pub fn poll_job<C>(&self, job_id: &str, on_complete: C) -> PollHandle
  where
    C: FnOnce(&Job) + Send + 'static,
  {
    let key = ComplianceQuery::Job { id: job_id.to_string() }.key();
    let client = self.client.clone();
    let id = job_id.to_string();
    Poller::new(self.cache.clone(), self.intervals.jobs).poll_until(
      &key,
      move |signal| {
        let client = client.clone();
        let id = id.clone();
        async move { client.get_job(&id, &signal).await }
      },
      Job::is_terminal,
      on_complete,
    )
  }

  /// Poll a document until its analysis finishes, then refresh the
  /// applicant's document list.
  pub fn poll_document(&self, document_id: &str) -> PollHandle {
    let key = ComplianceQuery::Document {
      id: document_id.to_string(),
    }
    .key();
    let client = self.client.clone();
    let cache = self.cache.clone();
    let id = document_id.to_string();
    Poller::new(self.cache.clone(), self.intervals.documents).poll_until(
      &key,
      move |signal| {
        let client = client.clone();
        let id = id.clone();
        async move { client.get_document(&id, &signal).await }
      },
      |document: &Document| document.status.is_terminal(),
      move |_document: &Document| {
        cache.invalidate(&Domain::Documents.lists());
      },
    )
  }
}
