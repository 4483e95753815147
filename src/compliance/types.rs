//! Resource shapes consumed from the compliance API.
//!
//! Only the fields the sync layer keys on or edits optimistically are typed;
//! everything else rides along in `extra` so a write-back never loses data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// List endpoint response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPage<T> {
  pub items: Vec<T>,
  pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicantStatus {
  Pending,
  InReview,
  Approved,
  Rejected,
  Escalated,
}

/// A reviewer's verdict on an applicant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
  Approve,
  Reject,
  Escalate,
}

impl Decision {
  /// The status an applicant ends up in once the decision is accepted.
  pub fn resulting_status(self) -> ApplicantStatus {
    match self {
      Decision::Approve => ApplicantStatus::Approved,
      Decision::Reject => ApplicantStatus::Rejected,
      Decision::Escalate => ApplicantStatus::Escalated,
    }
  }
}

impl std::str::FromStr for Decision {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "approve" | "approved" => Ok(Decision::Approve),
      "reject" | "rejected" => Ok(Decision::Reject),
      "escalate" | "escalated" => Ok(Decision::Escalate),
      other => Err(format!("unknown decision '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Applicant {
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub status: ApplicantStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub risk_level: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
  Open,
  InProgress,
  Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub applicant_id: Option<String>,
  pub status: CaseStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assignee: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Status of a long-running server job (document analysis, screening run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub applicant_id: Option<String>,
  pub status: JobStatus,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningResult {
  pub id: String,
  pub applicant_id: String,
  pub status: JobStatus,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Generic job shape returned by the polling endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub status: JobStatus,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Job {
  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }
}

/// Filters for the applicant list. Absent fields are omitted from the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicantFilter {
  pub status: Option<ApplicantStatus>,
  pub search: Option<String>,
  #[serde(default)]
  pub offset: u32,
  pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseFilter {
  pub status: Option<CaseStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assignee: Option<String>,
  #[serde(default)]
  pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
  pub decision: Decision,
  pub notes: Option<String>,
}
