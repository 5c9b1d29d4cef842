//! Counseling Record: the single entity stored in the Hub.
//! One record per interaction; rows are append-only and ordered by insertion.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Timestamp format written to the Hub (sheet-friendly, local time).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The one column schema every append is validated against.
pub const CANONICAL_HEADER: [&str; 7] = [
    "timestamp",
    "student_id",
    "target_type",
    "category",
    "risk_level",
    "raw_observation",
    "generated_text",
];

/// Loose header-keyed view of a scanned row.
pub type RowMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown target type: {0}")]
    UnknownTargetType(String),
    #[error("unknown category: {0}")]
    UnknownCategory(String),
    #[error("unknown risk level: {0}")]
    UnknownRiskLevel(String),
    #[error("row is missing column {0}")]
    MissingColumn(&'static str),
    #[error("bad timestamp {0:?}")]
    BadTimestamp(String),
}

/// Whether the interaction was with the student or with a parent/guardian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Student,
    Parent,
}

impl TargetType {
    pub const ALL: [TargetType; 2] = [TargetType::Student, TargetType::Parent];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Student => "student",
            TargetType::Parent => "parent",
        }
    }

    /// Form label shown in the UI.
    pub fn label(self) -> &'static str {
        match self {
            TargetType::Student => "學生",
            TargetType::Parent => "家長",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        TargetType::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(t) || v.label() == t)
            .ok_or_else(|| RecordError::UnknownTargetType(t.to_string()))
    }
}

/// Closed incident tag set offered by the form dropdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    AcademicStress,
    InterpersonalConflict,
    FamilyIssue,
    EmotionalDistress,
    BehavioralIssue,
    CareerPlanning,
    SelfHarmRisk,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::AcademicStress,
        Category::InterpersonalConflict,
        Category::FamilyIssue,
        Category::EmotionalDistress,
        Category::BehavioralIssue,
        Category::CareerPlanning,
        Category::SelfHarmRisk,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::AcademicStress => "academic_stress",
            Category::InterpersonalConflict => "interpersonal_conflict",
            Category::FamilyIssue => "family_issue",
            Category::EmotionalDistress => "emotional_distress",
            Category::BehavioralIssue => "behavioral_issue",
            Category::CareerPlanning => "career_planning",
            Category::SelfHarmRisk => "self_harm_risk",
            Category::Other => "other",
        }
    }

    pub fn english(self) -> &'static str {
        match self {
            Category::AcademicStress => "academic stress",
            Category::InterpersonalConflict => "interpersonal conflict",
            Category::FamilyIssue => "family issue",
            Category::EmotionalDistress => "emotional distress",
            Category::BehavioralIssue => "behavioral issue",
            Category::CareerPlanning => "career planning",
            Category::SelfHarmRisk => "self-harm risk",
            Category::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::AcademicStress => "學業壓力",
            Category::InterpersonalConflict => "人際衝突",
            Category::FamilyIssue => "家庭問題",
            Category::EmotionalDistress => "情緒困擾",
            Category::BehavioralIssue => "行為問題",
            Category::CareerPlanning => "生涯規劃",
            Category::SelfHarmRisk => "自傷風險",
            Category::Other => "其他",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = RecordError;

    /// Accepts the wire slug, the English label, or the Chinese dropdown label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| {
                c.as_str().eq_ignore_ascii_case(t) || c.english().eq_ignore_ascii_case(t) || c.label() == t
            })
            .ok_or_else(|| RecordError::UnknownCategory(t.to_string()))
    }
}

/// Three-valued triage tag derived from generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 3] = [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        RiskLevel::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(t))
            .ok_or_else(|| RecordError::UnknownRiskLevel(t.to_string()))
    }
}

/// One counseling interaction entry as persisted in the Hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounselingRecord {
    pub timestamp: String,
    pub student_id: String,
    pub target_type: TargetType,
    pub category: Category,
    pub risk_level: RiskLevel,
    pub raw_observation: String,
    pub generated_text: String,
}

impl CounselingRecord {
    /// Stamp a new record with the given time. Called once, at append time.
    pub fn stamped(
        at: DateTime<Local>,
        student_id: &str,
        target_type: TargetType,
        category: Category,
        risk_level: RiskLevel,
        raw_observation: String,
        generated_text: String,
    ) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            student_id: student_id.trim().to_string(),
            target_type,
            category,
            risk_level,
            raw_observation,
            generated_text,
        }
    }

    /// Cells in `CANONICAL_HEADER` order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.student_id.clone(),
            self.target_type.as_str().to_string(),
            self.category.as_str().to_string(),
            self.risk_level.as_str().to_string(),
            self.raw_observation.clone(),
            self.generated_text.clone(),
        ]
    }

    /// Map a scanned row by header name. Short rows (trailing empty cells dropped by the
    /// sheet API) are padded.
    pub fn from_row(header: &[String], row: &[String]) -> Result<Self, RecordError> {
        let map = row_map(header, row);
        let cell = |name: &'static str| -> Result<&str, RecordError> {
            map.get(name)
                .map(|s| s.as_str())
                .ok_or(RecordError::MissingColumn(name))
        };
        Ok(Self {
            timestamp: cell("timestamp")?.to_string(),
            student_id: cell("student_id")?.trim().to_string(),
            target_type: cell("target_type")?.parse()?,
            category: cell("category")?.parse()?,
            risk_level: cell("risk_level")?.parse()?,
            raw_observation: cell("raw_observation")?.to_string(),
            generated_text: cell("generated_text")?.to_string(),
        })
    }

    pub fn recorded_at(&self) -> Result<chrono::NaiveDateTime, RecordError> {
        chrono::NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT)
            .map_err(|_| RecordError::BadTimestamp(self.timestamp.clone()))
    }
}

/// Header-keyed map of one row; missing trailing cells become empty strings.
pub fn row_map(header: &[String], row: &[String]) -> RowMap {
    header
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), row.get(i).cloned().unwrap_or_default()))
        .collect()
}

pub fn canonical_header() -> Vec<String> {
    CANONICAL_HEADER.iter().map(|s| s.to_string()).collect()
}
