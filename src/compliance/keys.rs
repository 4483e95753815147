//! Cache keys for the compliance resources.
//!
//! Every key starts with its domain name so a domain can be invalidated as a
//! scope. Lists live under `<domain>/list`, single resources under
//! `<domain>/detail/<id>`.

use serde_json::json;

use super::types::{ApplicantFilter, CaseFilter};
use crate::cache::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
  Applicants,
  Cases,
  Documents,
  Screenings,
  Jobs,
}

impl Domain {
  pub const ALL: [Domain; 5] = [
    Domain::Applicants,
    Domain::Cases,
    Domain::Documents,
    Domain::Screenings,
    Domain::Jobs,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Domain::Applicants => "applicants",
      Domain::Cases => "cases",
      Domain::Documents => "documents",
      Domain::Screenings => "screenings",
      Domain::Jobs => "jobs",
    }
  }

  /// Map the singular prefix used by push events (`applicant.updated`).
  pub fn from_event_prefix(prefix: &str) -> Option<Self> {
    match prefix {
      "applicant" => Some(Domain::Applicants),
      "case" => Some(Domain::Cases),
      "document" => Some(Domain::Documents),
      "screening" => Some(Domain::Screenings),
      "job" => Some(Domain::Jobs),
      _ => None,
    }
  }

  /// Everything cached for this domain.
  pub fn scope(self) -> CacheKey {
    CacheKey::new(self.name())
  }

  /// Every list query of this domain, whatever its filters.
  pub fn lists(self) -> CacheKey {
    self.scope().push("list")
  }

  pub fn detail(self, id: &str) -> CacheKey {
    self.scope().push("detail").push(id)
  }
}

impl std::fmt::Display for Domain {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Query key types for compliance resources.
#[derive(Debug, Clone, PartialEq)]
pub enum ComplianceQuery {
  Applicants(ApplicantFilter),
  Applicant { id: String },
  Cases(CaseFilter),
  Case { id: String },
  ApplicantDocuments { applicant_id: String },
  Document { id: String },
  Screening { applicant_id: String },
  Job { id: String },
}

impl ComplianceQuery {
  pub fn domain(&self) -> Domain {
    match self {
      ComplianceQuery::Applicants(_) | ComplianceQuery::Applicant { .. } => Domain::Applicants,
      ComplianceQuery::Cases(_) | ComplianceQuery::Case { .. } => Domain::Cases,
      ComplianceQuery::ApplicantDocuments { .. } | ComplianceQuery::Document { .. } => {
        Domain::Documents
      }
      ComplianceQuery::Screening { .. } => Domain::Screenings,
      ComplianceQuery::Job { .. } => Domain::Jobs,
    }
  }

  pub fn key(&self) -> CacheKey {
    let domain = self.domain();
    match self {
      ComplianceQuery::Applicants(filter) => domain.lists().with_params(filter),
      ComplianceQuery::Cases(filter) => domain.lists().with_params(filter),
      ComplianceQuery::ApplicantDocuments { applicant_id } => domain
        .lists()
        .with_params(&json!({ "applicantId": applicant_id })),
      ComplianceQuery::Applicant { id }
      | ComplianceQuery::Case { id }
      | ComplianceQuery::Document { id }
      | ComplianceQuery::Job { id } => domain.detail(id),
      // One screening per applicant, addressed by the applicant.
      ComplianceQuery::Screening { applicant_id } => domain.detail(applicant_id),
    }
  }
}
