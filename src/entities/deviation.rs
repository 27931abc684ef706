//! Deviation report - a recorded out-of-tolerance or non-conforming condition
//!
//! A deviation blocks certificate issuance until the lab resolves it or the
//! customer accepts it. Status changes go through
//! [`DeviationWorkflow`](crate::core::workflow::DeviationWorkflow) and are
//! appended to the record's action log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::identity::{DeviationNumber, JobId, RunId};

/// Deviation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum DeviationType {
    /// A calculated value exceeds its limit
    #[default]
    OutOfTolerance,
    /// Temperature or humidity outside the lab band
    Environmental,
    /// Instrument or wrench malfunction
    EquipmentMalfunction,
    /// Reference standard expired or inactive
    StandardsExpired,
    /// Systematic measurement error
    MeasurementError,
    Other,
}

impl std::fmt::Display for DeviationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviationType::OutOfTolerance => write!(f, "out_of_tolerance"),
            DeviationType::Environmental => write!(f, "environmental"),
            DeviationType::EquipmentMalfunction => write!(f, "equipment_malfunction"),
            DeviationType::StandardsExpired => write!(f, "standards_expired"),
            DeviationType::MeasurementError => write!(f, "measurement_error"),
            DeviationType::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for DeviationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "out_of_tolerance" | "oot" => Ok(DeviationType::OutOfTolerance),
            "environmental" | "env" => Ok(DeviationType::Environmental),
            "equipment_malfunction" | "equipment" => Ok(DeviationType::EquipmentMalfunction),
            "standards_expired" | "standards" => Ok(DeviationType::StandardsExpired),
            "measurement_error" | "gb_failure" => Ok(DeviationType::MeasurementError),
            "other" => Ok(DeviationType::Other),
            _ => Err(format!(
                "Invalid deviation type: {}. Use out_of_tolerance, environmental, equipment_malfunction, standards_expired, measurement_error, or other",
                s
            )),
        }
    }
}

/// Severity of a tolerance finding or deviation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[derive(Default)]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" | "med" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            _ => Err(format!("Invalid severity: {}. Use low, medium, or high", s)),
        }
    }
}

/// Deviation status (workflow state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[derive(Default)]
pub enum DeviationStatus {
    #[default]
    Open,
    InReview,
    CustomerNotified,
    CustomerAccepted,
    /// Terminal: corrective action requires a new deviation
    CustomerRejected,
    /// Accepted with customer conditions carried onto the certificate
    Conditional,
    Resolved,
    Closed,
}

impl DeviationStatus {
    pub const ALL: [DeviationStatus; 8] = [
        DeviationStatus::Open,
        DeviationStatus::InReview,
        DeviationStatus::CustomerNotified,
        DeviationStatus::CustomerAccepted,
        DeviationStatus::CustomerRejected,
        DeviationStatus::Conditional,
        DeviationStatus::Resolved,
        DeviationStatus::Closed,
    ];

    /// Whether this status allows the certificate to be issued
    pub fn releases_certificate(&self) -> bool {
        matches!(
            self,
            DeviationStatus::Resolved
                | DeviationStatus::Closed
                | DeviationStatus::CustomerAccepted
                | DeviationStatus::Conditional
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviationStatus::Resolved | DeviationStatus::Closed | DeviationStatus::CustomerRejected
        )
    }
}

impl std::fmt::Display for DeviationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviationStatus::Open => write!(f, "OPEN"),
            DeviationStatus::InReview => write!(f, "IN_REVIEW"),
            DeviationStatus::CustomerNotified => write!(f, "CUSTOMER_NOTIFIED"),
            DeviationStatus::CustomerAccepted => write!(f, "CUSTOMER_ACCEPTED"),
            DeviationStatus::CustomerRejected => write!(f, "CUSTOMER_REJECTED"),
            DeviationStatus::Conditional => write!(f, "CONDITIONAL"),
            DeviationStatus::Resolved => write!(f, "RESOLVED"),
            DeviationStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

impl std::str::FromStr for DeviationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "OPEN" => Ok(DeviationStatus::Open),
            "IN_REVIEW" | "REVIEW" => Ok(DeviationStatus::InReview),
            "CUSTOMER_NOTIFIED" | "NOTIFIED" => Ok(DeviationStatus::CustomerNotified),
            "CUSTOMER_ACCEPTED" | "ACCEPTED" => Ok(DeviationStatus::CustomerAccepted),
            "CUSTOMER_REJECTED" | "REJECTED" => Ok(DeviationStatus::CustomerRejected),
            "CONDITIONAL" => Ok(DeviationStatus::Conditional),
            "RESOLVED" => Ok(DeviationStatus::Resolved),
            "CLOSED" => Ok(DeviationStatus::Closed),
            _ => Err(format!(
                "Invalid deviation status: {}. Use open, in_review, customer_notified, customer_accepted, customer_rejected, conditional, resolved, or closed",
                s
            )),
        }
    }
}

/// Customer decision on a notified deviation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CustomerDecision {
    Accept,
    Reject,
    Conditional,
}

impl CustomerDecision {
    /// Status the deviation moves to
    pub fn target_status(&self) -> DeviationStatus {
        match self {
            CustomerDecision::Accept => DeviationStatus::CustomerAccepted,
            CustomerDecision::Reject => DeviationStatus::CustomerRejected,
            CustomerDecision::Conditional => DeviationStatus::Conditional,
        }
    }
}

impl std::fmt::Display for CustomerDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CustomerDecision::Accept => write!(f, "ACCEPT"),
            CustomerDecision::Reject => write!(f, "REJECT"),
            CustomerDecision::Conditional => write!(f, "CONDITIONAL"),
        }
    }
}

impl std::str::FromStr for CustomerDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accept" | "accepted" => Ok(CustomerDecision::Accept),
            "reject" | "rejected" => Ok(CustomerDecision::Reject),
            "conditional" | "conditions" => Ok(CustomerDecision::Conditional),
            _ => Err(format!(
                "Invalid customer decision: {}. Use accept, reject, or conditional",
                s
            )),
        }
    }
}

/// Kind of entry in the deviation action log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Created,
    StatusChange,
    CustomerResponse,
    Resolved,
    Closed,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Created => write!(f, "CREATED"),
            ActionType::StatusChange => write!(f, "STATUS_CHANGE"),
            ActionType::CustomerResponse => write!(f, "CUSTOMER_RESPONSE"),
            ActionType::Resolved => write!(f, "RESOLVED"),
            ActionType::Closed => write!(f, "CLOSED"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(ActionType::Created),
            "STATUS_CHANGE" => Ok(ActionType::StatusChange),
            "CUSTOMER_RESPONSE" => Ok(ActionType::CustomerResponse),
            "RESOLVED" => Ok(ActionType::Resolved),
            "CLOSED" => Ok(ActionType::Closed),
            _ => Err(format!("Invalid action type: {}", s)),
        }
    }
}

/// Audit-trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationAction {
    pub action_type: ActionType,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<DeviationStatus>,
    pub new_status: DeviationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Customer response carried on the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerResponse {
    pub decision: CustomerDecision,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Conditions to print on the certificate (conditional acceptance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
}

/// Resolution details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub actions: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Request to create a deviation, emitted by the tolerance engine
///
/// Numbering and persistence belong to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationRequest {
    pub deviation_type: DeviationType,
    pub severity: Severity,
    /// Tolerance check that produced the request; `None` for the summary record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<String>,
    pub description: String,
    pub technical_impact: String,
    pub customer_impact: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub affected_measurements: BTreeMap<String, f64>,
}

/// Persisted deviation report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationRecord {
    /// Report number (DEV-<job>-<seq>)
    pub number: DeviationNumber,

    pub job_id: JobId,

    /// Workflow run that raised the deviation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,

    pub deviation_type: DeviationType,

    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<String>,

    pub description: String,

    pub technical_impact: String,

    pub customer_impact: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub affected_measurements: BTreeMap<String, f64>,

    #[serde(default)]
    pub status: DeviationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_response: Option<CustomerResponse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    pub identified_by: String,

    pub created: DateTime<Utc>,

    /// Audit trail, oldest first
    #[serde(default)]
    pub actions: Vec<DeviationAction>,
}

impl DeviationRecord {
    /// Create an OPEN record from a request, logging the creation
    pub fn from_request(
        number: DeviationNumber,
        job_id: JobId,
        run_id: Option<RunId>,
        request: DeviationRequest,
        identified_by: &str,
    ) -> Self {
        let created = Utc::now();
        let comment = format!("Deviation created: {}", request.deviation_type);
        Self {
            number,
            job_id,
            run_id,
            deviation_type: request.deviation_type,
            severity: request.severity,
            check_type: request.check_type,
            description: request.description,
            technical_impact: request.technical_impact,
            customer_impact: request.customer_impact,
            recommendations: request.recommendations,
            affected_measurements: request.affected_measurements,
            status: DeviationStatus::Open,
            customer_response: None,
            resolution: None,
            identified_by: identified_by.to_string(),
            created,
            actions: vec![DeviationAction {
                action_type: ActionType::Created,
                actor: identified_by.to_string(),
                timestamp: created,
                old_status: None,
                new_status: DeviationStatus::Open,
                comment: Some(comment),
            }],
        }
    }

    /// Conditions the certificate must carry, if conditionally accepted
    pub fn certificate_conditions(&self) -> Option<&str> {
        match (&self.status, &self.customer_response) {
            (DeviationStatus::Conditional, Some(resp)) => resp.conditions.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeviationRequest {
        DeviationRequest {
            deviation_type: DeviationType::Environmental,
            severity: Severity::High,
            check_type: Some("environmental_conditions".to_string()),
            description: "Temperature before (32°C) above maximum limit (30°C)".to_string(),
            technical_impact: "CRITICAL: environment".to_string(),
            customer_impact: "Certificate may require conditional acceptance".to_string(),
            recommendations: vec!["Repeat calibration".to_string()],
            affected_measurements: BTreeMap::from([("temp_before".to_string(), 32.0)]),
        }
    }

    #[test]
    fn test_record_from_request() {
        let job: JobId = "JOB-1".parse().unwrap();
        let record = DeviationRecord::from_request(
            DeviationNumber::new(job.clone(), 1),
            job,
            None,
            request(),
            "engine",
        );
        assert_eq!(record.number.to_string(), "DEV-JOB-1-001");
        assert_eq!(record.status, DeviationStatus::Open);
        assert_eq!(record.actions.len(), 1);
        assert_eq!(record.actions[0].action_type, ActionType::Created);
        assert_eq!(record.actions[0].old_status, None);
    }

    #[test]
    fn test_deviation_type_parsing() {
        assert_eq!(
            "oot".parse::<DeviationType>().unwrap(),
            DeviationType::OutOfTolerance
        );
        assert_eq!(
            "GB_FAILURE".parse::<DeviationType>().unwrap(),
            DeviationType::MeasurementError
        );
        assert!("bogus".parse::<DeviationType>().is_err());
    }

    #[test]
    fn test_status_parsing_and_display() {
        for status in DeviationStatus::ALL {
            assert_eq!(status.to_string().parse::<DeviationStatus>().unwrap(), status);
        }
        assert_eq!(
            "in-review".parse::<DeviationStatus>().unwrap(),
            DeviationStatus::InReview
        );
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&DeviationStatus::CustomerNotified).unwrap();
        assert_eq!(json, "\"CUSTOMER_NOTIFIED\"");
        let sev = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(sev, "\"HIGH\"");
    }

    #[test]
    fn test_certificate_release() {
        assert!(DeviationStatus::Resolved.releases_certificate());
        assert!(DeviationStatus::Conditional.releases_certificate());
        assert!(!DeviationStatus::CustomerRejected.releases_certificate());
        assert!(!DeviationStatus::Open.releases_certificate());
        assert!(DeviationStatus::CustomerRejected.is_terminal());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!([Severity::Low, Severity::High].iter().max(), Some(&Severity::High));
    }

    #[test]
    fn test_record_roundtrip_json() {
        let job: JobId = "25060-13".parse().unwrap();
        let record = DeviationRecord::from_request(
            DeviationNumber::new(job.clone(), 2),
            job,
            Some(RunId::new()),
            request(),
            "engine",
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["number"], "DEV-25060-13-002");
        assert_eq!(json["status"], "OPEN");
        let back: DeviationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
