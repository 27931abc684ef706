//! Deviation workflow: status transitions, customer decisions and the
//! certificate gate
//!
//! ```text
//! OPEN -> IN_REVIEW -> CUSTOMER_NOTIFIED -> CUSTOMER_ACCEPTED -> RESOLVED -> CLOSED
//!                                        -> CONDITIONAL       -> RESOLVED
//!                                        -> CUSTOMER_REJECTED (terminal)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::identity::DeviationNumber;
use crate::entities::deviation::{
    ActionType, CustomerDecision, CustomerResponse, DeviationAction, DeviationRecord,
    DeviationStatus, Resolution,
};
use crate::entities::job::CalculationStatus;

/// Errors raised by workflow operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid status transition for {number}: {from} → {to}")]
    InvalidTransition {
        number: String,
        from: DeviationStatus,
        to: DeviationStatus,
    },

    #[error("Deviation {number} is not in {expected} status (current: {current})")]
    WrongStatus {
        number: String,
        expected: DeviationStatus,
        current: DeviationStatus,
    },

    #[error("Conditional acceptance of {0} requires the customer's conditions")]
    MissingConditions(String),

    #[error("Resolution of {0} requires a description of the actions taken")]
    MissingResolution(String),
}

/// Status machine for deviation records
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviationWorkflow;

impl DeviationWorkflow {
    pub fn new() -> Self {
        Self
    }

    /// Check if a status transition is valid
    pub fn is_valid_transition(&self, from: DeviationStatus, to: DeviationStatus) -> bool {
        use DeviationStatus::*;
        matches!(
            (from, to),
            (Open, InReview)
                | (InReview, CustomerNotified)
                | (CustomerNotified, CustomerAccepted)
                | (CustomerNotified, CustomerRejected)
                | (CustomerNotified, Conditional)
                | (CustomerAccepted, Resolved)
                | (Conditional, Resolved)
                | (Resolved, Closed)
        )
    }

    /// Get allowed transitions from the current status
    pub fn allowed_transitions(&self, current: DeviationStatus) -> Vec<DeviationStatus> {
        DeviationStatus::ALL
            .into_iter()
            .filter(|to| self.is_valid_transition(current, *to))
            .collect()
    }

    pub fn can_transition(
        &self,
        record: &DeviationRecord,
        to: DeviationStatus,
    ) -> Result<(), TransitionError> {
        if !self.is_valid_transition(record.status, to) {
            return Err(TransitionError::InvalidTransition {
                number: record.number.to_string(),
                from: record.status,
                to,
            });
        }
        Ok(())
    }

    /// Move a record to `to` and append the action to its log
    pub fn transition(
        &self,
        record: &mut DeviationRecord,
        to: DeviationStatus,
        actor: &str,
        comment: Option<&str>,
    ) -> Result<(), TransitionError> {
        let action_type = match to {
            DeviationStatus::Resolved => ActionType::Resolved,
            DeviationStatus::Closed => ActionType::Closed,
            DeviationStatus::CustomerAccepted
            | DeviationStatus::CustomerRejected
            | DeviationStatus::Conditional => ActionType::CustomerResponse,
            _ => ActionType::StatusChange,
        };
        self.apply(record, to, action_type, actor, comment.map(str::to_string))
    }

    /// Record the customer's decision on a notified deviation
    pub fn decide(
        &self,
        record: &mut DeviationRecord,
        decision: CustomerDecision,
        actor: &str,
        comments: Option<&str>,
        conditions: Option<&str>,
    ) -> Result<(), TransitionError> {
        if record.status != DeviationStatus::CustomerNotified {
            return Err(TransitionError::WrongStatus {
                number: record.number.to_string(),
                expected: DeviationStatus::CustomerNotified,
                current: record.status,
            });
        }
        let conditions = conditions.map(str::trim).filter(|c| !c.is_empty());
        if decision == CustomerDecision::Conditional && conditions.is_none() {
            return Err(TransitionError::MissingConditions(record.number.to_string()));
        }

        let comment = format!("Customer {}", decision.to_string().to_lowercase());
        let comment = match comments {
            Some(c) => format!("{}: {}", comment, c),
            None => comment,
        };
        self.apply(
            record,
            decision.target_status(),
            ActionType::CustomerResponse,
            actor,
            Some(comment),
        )?;

        record.customer_response = Some(CustomerResponse {
            decision,
            decided_by: actor.to_string(),
            decided_at: Utc::now(),
            comments: comments.map(str::to_string),
            conditions: conditions.map(str::to_string),
        });
        Ok(())
    }

    /// Resolve an accepted or conditionally accepted deviation
    pub fn resolve(
        &self,
        record: &mut DeviationRecord,
        actions: &str,
        actor: &str,
    ) -> Result<(), TransitionError> {
        let actions = actions.trim();
        if actions.is_empty() {
            return Err(TransitionError::MissingResolution(record.number.to_string()));
        }
        self.apply(
            record,
            DeviationStatus::Resolved,
            ActionType::Resolved,
            actor,
            Some(actions.to_string()),
        )?;
        record.resolution = Some(Resolution {
            actions: actions.to_string(),
            resolved_by: actor.to_string(),
            resolved_at: Utc::now(),
        });
        Ok(())
    }

    fn apply(
        &self,
        record: &mut DeviationRecord,
        to: DeviationStatus,
        action_type: ActionType,
        actor: &str,
        comment: Option<String>,
    ) -> Result<(), TransitionError> {
        self.can_transition(record, to)?;
        let from = record.status;
        record.status = to;
        record.actions.push(DeviationAction {
            action_type,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            old_status: Some(from),
            new_status: to,
            comment,
        });
        tracing::info!(
            deviation = %record.number,
            from = %from,
            to = %to,
            actor,
            "deviation status changed"
        );
        Ok(())
    }
}

/// Certificate eligibility derived from a job's deviations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateGate {
    pub can_generate_certificate: bool,
    /// Deviations still awaiting resolution or a customer decision
    pub pending: Vec<DeviationNumber>,
    /// Deviations the customer rejected
    pub rejected: Vec<DeviationNumber>,
    /// Conditions to carry onto the certificate
    pub conditions: Vec<String>,
}

impl CertificateGate {
    /// Evaluate the gate over every deviation of a job
    pub fn evaluate(records: &[DeviationRecord]) -> Self {
        let mut pending = Vec::new();
        let mut rejected = Vec::new();
        let mut conditions = Vec::new();

        for record in records {
            match record.status {
                DeviationStatus::CustomerRejected => rejected.push(record.number.clone()),
                status if !status.releases_certificate() => pending.push(record.number.clone()),
                _ => {}
            }
            if let Some(c) = record.certificate_conditions() {
                conditions.push(c.to_string());
            }
        }

        Self {
            can_generate_certificate: pending.is_empty() && rejected.is_empty(),
            pending,
            rejected,
            conditions,
        }
    }

    /// Job status implied by customer decisions, if any
    ///
    /// A rejection always wins. Approval needs every deviation to release
    /// the certificate.
    pub fn job_status(&self) -> Option<CalculationStatus> {
        if !self.rejected.is_empty() {
            Some(CalculationStatus::Rejected)
        } else if self.can_generate_certificate {
            Some(CalculationStatus::Approved)
        } else {
            None
        }
    }
}
