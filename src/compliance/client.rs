use serde::Serialize;
use serde_json::{json, Value};

use super::types::{
  Applicant, ApplicantFilter, Case, CaseFilter, Document, Job, ListPage, ReviewRequest,
  ScreeningResult,
};
use crate::cancel::CancelSignal;
use crate::client::ResourceClient;
use crate::error::SyncError;

/// Compliance API endpoints, one method per call.
#[derive(Clone)]
pub struct ComplianceClient {
  http: ResourceClient,
}

impl ComplianceClient {
  pub fn new(http: ResourceClient) -> Self {
    Self { http }
  }

  /// List applicants matching `filter`.
  pub async fn list_applicants(
    &self,
    filter: &ApplicantFilter,
    signal: &CancelSignal,
  ) -> Result<ListPage<Applicant>, SyncError> {
    self.http.get(&["applicants"], &query_pairs(filter), signal).await
  }

  pub async fn get_applicant(&self, id: &str, signal: &CancelSignal) -> Result<Applicant, SyncError> {
    self.http.get(&["applicants", id], &[], signal).await
  }

  /// Record a review decision. The server answers with the updated applicant.
  pub async fn review_applicant(
    &self,
    id: &str,
    review: &ReviewRequest,
    signal: &CancelSignal,
  ) -> Result<Applicant, SyncError> {
    self
      .http
      .post(&["applicants", id, "review"], review, signal)
      .await
  }

  pub async fn list_cases(
    &self,
    filter: &CaseFilter,
    signal: &CancelSignal,
  ) -> Result<ListPage<Case>, SyncError> {
    self.http.get(&["cases"], &query_pairs(filter), signal).await
  }

  pub async fn get_case(&self, id: &str, signal: &CancelSignal) -> Result<Case, SyncError> {
    self.http.get(&["cases", id], &[], signal).await
  }

  pub async fn resolve_case(
    &self,
    id: &str,
    resolution: &str,
    signal: &CancelSignal,
  ) -> Result<Case, SyncError> {
    self
      .http
      .post(
        &["cases", id, "resolve"],
        &json!({ "resolution": resolution }),
        signal,
      )
      .await
  }

  pub async fn assign_case(
    &self,
    id: &str,
    assignee: &str,
    signal: &CancelSignal,
  ) -> Result<Case, SyncError> {
    self
      .http
      .patch(
        &["cases", id],
        &json!({ "assignee": assignee }),
        signal,
      )
      .await
  }

  pub async fn list_documents(
    &self,
    applicant_id: &str,
    signal: &CancelSignal,
  ) -> Result<ListPage<Document>, SyncError> {
    self
      .http
      .get(&["applicants", applicant_id, "documents"], &[], signal)
      .await
  }

  pub async fn get_document(&self, id: &str, signal: &CancelSignal) -> Result<Document, SyncError> {
    self.http.get(&["documents", id], &[], signal).await
  }

  pub async fn get_screening(
    &self,
    applicant_id: &str,
    signal: &CancelSignal,
  ) -> Result<ScreeningResult, SyncError> {
    self
      .http
      .get(&["applicants", applicant_id, "screening"], &[], signal)
      .await
  }

  pub async fn get_job(&self, id: &str, signal: &CancelSignal) -> Result<Job, SyncError> {
    self.http.get(&["jobs", id], &[], signal).await
  }
}

/// Flatten a filter struct into query pairs, skipping absent fields.
fn query_pairs(filter: &impl Serialize) -> Vec<(String, String)> {
  let Ok(Value::Object(map)) = serde_json::to_value(filter) else {
    return Vec::new();
  };
  map
    .into_iter()
    .filter_map(|(name, value)| match value {
      Value::Null => None,
      Value::String(s) => Some((name, s)),
      other => Some((name, other.to_string())),
    })
    .collect()
}
