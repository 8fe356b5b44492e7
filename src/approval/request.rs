//! Approval request documents and the pure relocation transition table.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::descriptor;
use crate::vault::Location;

/// Risk classification of a proposed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Whether a step of this risk level must pause at the gateway.
///
/// Low never gates; medium gates only for task types the policy names;
/// high always gates.
pub fn requires_gate(
    risk: RiskLevel,
    task_type: Option<&str>,
    medium_gated_types: &HashSet<String>,
) -> bool {
    match risk {
        RiskLevel::Low => false,
        RiskLevel::Medium => task_type.is_some_and(|t| medium_gated_types.contains(t)),
        RiskLevel::High => true,
    }
}

/// Outcome of a human decision on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Rejected,
    /// The proposal was edited before approval; re-validate and re-file pending.
    Modified,
    /// The expiry elapsed with no decision — an implicit rejection.
    Expired,
}

impl Resolution {
    /// Stable reason code recorded in failure lists and reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "approval_rejected",
            Self::Modified => "approval_modified",
            Self::Expired => "approval_expired",
        }
    }
}

/// Interpret a document relocation as a resolution.
///
/// A pure lookup on `{source, destination}` — content is never inspected
/// here, so a request's fate is unambiguous even if it was edited in place
/// (an edit keeps it pending: same source and destination).
pub fn resolve_relocation(from: &Location, to: &Location) -> Option<Resolution> {
    match (from, to) {
        (Location::PendingApproval, Location::Approved) => Some(Resolution::Approved),
        (Location::PendingApproval, Location::Rejected) => Some(Resolution::Rejected),
        _ => None,
    }
}

/// A pending human decision for one task step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub task_id: String,
    pub step_id: String,
    pub risk: RiskLevel,
    pub proposed_action: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Frontmatter header of a request document.
#[derive(Debug, Serialize, Deserialize)]
struct RequestHeader {
    request_id: Uuid,
    task_id: String,
    step_id: String,
    risk_level: RiskLevel,
    status: String,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        risk: RiskLevel,
        proposed_action: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            step_id: step_id.into(),
            risk,
            proposed_action: proposed_action.into(),
            created_at,
            expires_at: created_at
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Filename identifying this request document across locations.
    pub fn filename(&self) -> String {
        format!("approval_{}.md", self.id)
    }

    /// Render the human-facing request document.
    pub fn to_document(&self) -> String {
        let header = RequestHeader {
            request_id: self.id,
            task_id: self.task_id.clone(),
            step_id: self.step_id.clone(),
            risk_level: self.risk,
            status: "pending".to_string(),
            created: self.created_at,
            expires: self.expires_at,
        };
        let yaml = serde_yaml::to_string(&header).unwrap_or_default();
        format!(
            "---\n{yaml}---\n# Approval Request\n\n\
             Task `{task}`, step `{step}` (risk: {risk}).\n\n\
             ## Proposed Action\n\n{action}\n\n\
             ## Instructions\n\n\
             - To approve: move this file to the Approved folder\n\
             - To reject: move this file to the Rejected folder\n\
             - To request changes: edit the proposed action above, then move to Approved\n",
            task = self.task_id,
            step = self.step_id,
            risk = self.risk,
            action = self.proposed_action,
        )
    }

    /// Parse a request document back into its model.
    pub fn from_document(content: &str) -> Result<Self, String> {
        let (yaml, body) = descriptor::split_frontmatter(content).map_err(|e| match e {
            descriptor::HeaderError::Missing => "missing request header".to_string(),
            descriptor::HeaderError::Syntax(msg) => msg,
        })?;
        let header: RequestHeader = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
        Ok(Self {
            id: header.request_id,
            task_id: header.task_id,
            step_id: header.step_id,
            risk: header.risk_level,
            proposed_action: extract_proposal(body).unwrap_or_default(),
            created_at: header.created,
            expires_at: header.expires,
        })
    }
}

/// Extract the proposed-action section from a request body.
///
/// Used to detect human edits before approval: a changed proposal resolves
/// as `modified` rather than `approved`.
pub fn extract_proposal(body: &str) -> Option<String> {
    let after = body.split("## Proposed Action").nth(1)?;
    let section = after.split("\n## ").next().unwrap_or(after);
    Some(section.trim().to_string())
}
