//! Identifiers for jobs, workflow runs and deviation records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

/// Errors raised while parsing identifiers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Job identifier '{0}' contains whitespace")]
    Whitespace(String),

    #[error("Missing '-' delimiter in '{0}'")]
    MissingDelimiter(String),

    #[error("Invalid prefix in '{0}' (expected {1})")]
    InvalidPrefix(String, &'static str),

    #[error("Invalid ULID '{0}': {1}")]
    InvalidUlid(String, String),

    #[error("Invalid deviation sequence in '{0}'")]
    InvalidSequence(String),
}

/// Laboratory job identifier (e.g. `JOB-25001` or a work id such as `25060-13`)
///
/// Owned by the job collaborator; the engine only checks that it is usable
/// as a key and as part of a deviation number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdParseError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(IdParseError::Whitespace(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Identifier of a single workflow run (`RUN-<ULID>`)
///
/// ULIDs sort by creation time, so runs of a job list in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Ulid);

impl RunId {
    pub const PREFIX: &'static str = "RUN";

    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", Self::PREFIX, self.0)
    }
}

impl FromStr for RunId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, ulid_str) = s
            .split_once('-')
            .ok_or_else(|| IdParseError::MissingDelimiter(s.to_string()))?;
        if !prefix.eq_ignore_ascii_case(Self::PREFIX) {
            return Err(IdParseError::InvalidPrefix(s.to_string(), Self::PREFIX));
        }
        let ulid = Ulid::from_string(ulid_str)
            .map_err(|e| IdParseError::InvalidUlid(ulid_str.to_string(), e.to_string()))?;
        Ok(Self(ulid))
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deviation report number: `DEV-<job>-<seq>` with a three-digit sequence
///
/// The job part may itself contain dashes, so parsing splits on the first
/// and last delimiter only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviationNumber {
    job: JobId,
    sequence: u32,
}

impl DeviationNumber {
    pub const PREFIX: &'static str = "DEV";

    pub fn new(job: JobId, sequence: u32) -> Self {
        Self { job, sequence }
    }

    pub fn job(&self) -> &JobId {
        &self.job
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for DeviationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:03}", Self::PREFIX, self.job, self.sequence)
    }
}

impl FromStr for DeviationNumber {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once('-')
            .ok_or_else(|| IdParseError::MissingDelimiter(s.to_string()))?;
        if !prefix.eq_ignore_ascii_case(Self::PREFIX) {
            return Err(IdParseError::InvalidPrefix(s.to_string(), Self::PREFIX));
        }
        let (job, seq) = rest
            .rsplit_once('-')
            .ok_or_else(|| IdParseError::MissingDelimiter(s.to_string()))?;
        let sequence = seq
            .parse::<u32>()
            .map_err(|_| IdParseError::InvalidSequence(s.to_string()))?;
        Ok(Self {
            job: job.parse()?,
            sequence,
        })
    }
}

impl Serialize for DeviationNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviationNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_rejects_blank_and_whitespace() {
        assert_eq!("".parse::<JobId>(), Err(IdParseError::Empty));
        assert!(matches!(
            "JOB 1".parse::<JobId>(),
            Err(IdParseError::Whitespace(_))
        ));
        assert_eq!("  JOB-25001 ".parse::<JobId>().unwrap().as_str(), "JOB-25001");
    }

    #[test]
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        assert!(s.starts_with("RUN-"));
        assert_eq!(s.parse::<RunId>().unwrap(), id);
    }

    #[test]
    fn test_run_id_wrong_prefix() {
        let s = format!("DEV-{}", Ulid::new());
        assert!(matches!(
            s.parse::<RunId>(),
            Err(IdParseError::InvalidPrefix(_, "RUN"))
        ));
    }

    #[test]
    fn test_deviation_number_format() {
        let job: JobId = "25060-13".parse().unwrap();
        let number = DeviationNumber::new(job, 7);
        assert_eq!(number.to_string(), "DEV-25060-13-007");
    }

    #[test]
    fn test_deviation_number_parse_with_dashed_job() {
        let number: DeviationNumber = "DEV-25060-13-012".parse().unwrap();
        assert_eq!(number.job().as_str(), "25060-13");
        assert_eq!(number.sequence(), 12);
    }

    #[test]
    fn test_deviation_number_bad_sequence() {
        assert!(matches!(
            "DEV-JOB1-abc".parse::<DeviationNumber>(),
            Err(IdParseError::InvalidSequence(_))
        ));
    }
}
