//! Reviewer actions as cache-aware mutations.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};

use super::client::ComplianceClient;
use super::keys::Domain;
use super::types::{Applicant, Case, CaseStatus, Decision, ReviewRequest};
use crate::cache::CacheKey;
use crate::cancel::CancelSignal;
use crate::error::SyncError;
use crate::mutation::{ItemOperation, Operation};

/// Replace `field` in an object entry, leaving everything else untouched.
fn with_field(current: Option<&Value>, field: &str, value: Value) -> Option<Value> {
  let mut next = current?.clone();
  next.as_object_mut()?.insert(field.to_string(), value);
  Some(next)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInput {
  pub applicant_id: String,
  pub decision: Decision,
  pub notes: Option<String>,
}

/// Approve, reject or escalate an applicant.
pub struct ReviewApplicant {
  client: ComplianceClient,
}

impl ReviewApplicant {
  pub fn new(client: ComplianceClient) -> Self {
    Self { client }
  }
}

impl Operation for ReviewApplicant {
  type Input = ReviewInput;
  type Output = Applicant;

  fn name(&self) -> &'static str {
    "review_applicant"
  }

  fn target(&self, input: &ReviewInput) -> Option<CacheKey> {
    Some(Domain::Applicants.detail(&input.applicant_id))
  }

  fn optimistic(&self, current: Option<&Value>, input: &ReviewInput) -> Option<Value> {
    with_field(current, "status", json!(input.decision.resulting_status()))
  }

  fn call(&self, input: ReviewInput, signal: CancelSignal) -> BoxFuture<'static, Result<Applicant, SyncError>> {
    let client = self.client.clone();
    async move {
      let review = ReviewRequest {
        decision: input.decision,
        notes: input.notes,
      };
      client
        .review_applicant(&input.applicant_id, &review, &signal)
        .await
    }
    .boxed()
  }

  fn dependents(&self, input: &ReviewInput, _output: &Applicant) -> Vec<CacheKey> {
    // A decision moves the applicant between filtered lists and may open a case.
    vec![
      Domain::Applicants.detail(&input.applicant_id),
      Domain::Applicants.lists(),
      Domain::Cases.scope(),
    ]
  }
}

impl ItemOperation for ReviewApplicant {
  type Params = Decision;

  fn item_input(&self, id: &str, decision: &Decision) -> ReviewInput {
    ReviewInput {
      applicant_id: id.to_string(),
      decision: *decision,
      notes: None,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveInput {
  pub case_id: String,
  pub resolution: String,
}

pub struct ResolveCase {
  client: ComplianceClient,
}

impl ResolveCase {
  pub fn new(client: ComplianceClient) -> Self {
    Self { client }
  }
}

impl Operation for ResolveCase {
  type Input = ResolveInput;
  type Output = Case;

  fn name(&self) -> &'static str {
    "resolve_case"
  }

  fn target(&self, input: &ResolveInput) -> Option<CacheKey> {
    Some(Domain::Cases.detail(&input.case_id))
  }

  fn optimistic(&self, current: Option<&Value>, _input: &ResolveInput) -> Option<Value> {
    with_field(current, "status", json!(CaseStatus::Resolved))
  }

  fn call(&self, input: ResolveInput, signal: CancelSignal) -> BoxFuture<'static, Result<Case, SyncError>> {
    let client = self.client.clone();
    async move {
      client
        .resolve_case(&input.case_id, &input.resolution, &signal)
        .await
    }
    .boxed()
  }

  fn dependents(&self, _input: &ResolveInput, output: &Case) -> Vec<CacheKey> {
    let mut scopes = vec![Domain::Cases.lists()];
    if let Some(applicant_id) = &output.applicant_id {
      scopes.push(Domain::Applicants.detail(applicant_id));
    }
    scopes
  }
}

impl ItemOperation for ResolveCase {
  type Params = String;

  fn item_input(&self, id: &str, resolution: &String) -> ResolveInput {
    ResolveInput {
      case_id: id.to_string(),
      resolution: resolution.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignInput {
  pub case_id: String,
  pub assignee: String,
}

pub struct AssignCase {
  client: ComplianceClient,
}

impl AssignCase {
  pub fn new(client: ComplianceClient) -> Self {
    Self { client }
  }
}

impl Operation for AssignCase {
  type Input = AssignInput;
  type Output = Case;

  fn name(&self) -> &'static str {
    "assign_case"
  }

  fn target(&self, input: &AssignInput) -> Option<CacheKey> {
    Some(Domain::Cases.detail(&input.case_id))
  }

  fn optimistic(&self, current: Option<&Value>, input: &AssignInput) -> Option<Value> {
    with_field(current, "assignee", json!(input.assignee))
  }

  fn call(&self, input: AssignInput, signal: CancelSignal) -> BoxFuture<'static, Result<Case, SyncError>> {
    let client = self.client.clone();
    async move { client.assign_case(&input.case_id, &input.assignee, &signal).await }.boxed()
  }

  fn dependents(&self, _input: &AssignInput, _output: &Case) -> Vec<CacheKey> {
    vec![Domain::Cases.lists()]
  }
}
