//! Reference standard - a traceable master instrument used during calibration

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStandard {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// Calibration certificate number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// Last day the standard's own calibration is valid
    pub valid_until: NaiveDate,

    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ReferenceStandard {
    pub fn new(id: impl Into<String>, name: impl Into<String>, valid_until: NaiveDate) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            serial_number: None,
            certificate: None,
            valid_until,
            is_active: true,
        }
    }

    /// Expired when the validity date lies before `on`
    pub fn is_expired(&self, on: NaiveDate) -> bool {
        self.valid_until < on
    }

    /// Usable for traceable work on `on`
    pub fn is_valid(&self, on: NaiveDate) -> bool {
        self.is_active && !self.is_expired(on)
    }
}
