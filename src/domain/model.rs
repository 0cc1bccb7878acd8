use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type SourceId = String;

/// 單一 DHIS2 實例的連線資訊
#[derive(Clone, Serialize, Deserialize)]
pub struct Dhis2Instance {
    pub id: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_seconds: Option<u64>,
}

impl fmt::Debug for Dhis2Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dhis2Instance")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// 一個比對來源 = 某個實例上的某個 dataset
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: SourceId,
    /// 位置標籤 (dataset1, dataset2, ...)，輸出時以此定位來源
    pub label: String,
    pub instance: Dhis2Instance,
    pub dataset_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ElementRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// The same indicator as it exists in each source. A `None` element means the
/// source does not carry this indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalElementGroup {
    pub id: String,
    pub logical_name: String,
    pub elements: HashMap<SourceId, Option<ElementRef>>,
}

impl LogicalElementGroup {
    pub fn element_for(&self, source_id: &str) -> Option<&ElementRef> {
        self.elements.get(source_id).and_then(|e| e.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataValue {
    pub data_element: String,
    pub org_unit: String,
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_option_combo: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl RawDataValue {
    pub fn new(data_element: &str, org_unit: &str, period: &str, value: Option<&str>) -> Self {
        Self {
            data_element: data_element.to_string(),
            org_unit: org_unit.to_string(),
            period: period.to_string(),
            category_option_combo: None,
            value: value.map(str::to_string),
            last_updated: None,
        }
    }

    /// 非空字串的值；空字串視為缺值
    pub fn present_value(&self) -> Option<&str> {
        self.value.as_deref().filter(|v| !v.is_empty())
    }

    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_deref().and_then(parse_number)
    }
}

/// Parses a finite number; `NaN`/`inf` spellings are rejected.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Valid,
    Mismatch,
    Missing,
    OutOfRange,
    /// Reserved: majority agreement is annotated via `consensus_value`,
    /// never assigned by the classifier.
    Consensus,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Valid => "valid",
            RecordStatus::Mismatch => "mismatch",
            RecordStatus::Missing => "missing",
            RecordStatus::OutOfRange => "out_of_range",
            RecordStatus::Consensus => "consensus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceValue {
    pub label: String,
    pub element_id: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedRecord {
    pub group_id: String,
    pub logical_name: String,
    pub org_unit: String,
    pub org_unit_name: String,
    pub period: String,
    /// 每個來源恰好一筆，依來源順序排列
    pub values: Vec<SourceValue>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_value: Option<String>,
}

impl AlignedRecord {
    pub fn value_for(&self, label: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.label == label)
            .and_then(|v| v.value.as_deref())
    }

    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.value.as_deref())
    }

    pub fn value_slots(&self) -> Vec<Option<&str>> {
        self.values.iter().map(|v| v.value.as_deref()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSummary {
    pub total_records: usize,
    pub valid_records: usize,
    pub mismatched_records: usize,
    pub missing_records: usize,
    pub out_of_range_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub records: Vec<AlignedRecord>,
    pub summary: ComparisonSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Range,
    Consistency,
    Outlier,
    Mandatory,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuleType::Range => "range",
            RuleType::Consistency => "consistency",
            RuleType::Outlier => "outlier",
            RuleType::Mandatory => "mandatory",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    #[default]
    Warning,
    Info,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub data_elements: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub org_unit_levels: Option<Vec<u32>>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub passed: bool,
    /// The rule itself could not be evaluated (bad condition, missing config).
    #[serde(default)]
    pub misconfigured: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ValidationResult {
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrgUnitInfo {
    pub name: String,
    pub level: Option<u32>,
}

/// 由 metadata API 取得的可讀名稱
#[derive(Debug, Clone, Default)]
pub struct ResolvedNames {
    pub dataset_name: Option<String>,
    pub org_units: HashMap<String, OrgUnitInfo>,
    pub period_name: Option<String>,
}

impl ResolvedNames {
    pub fn org_unit_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.org_units.get(id).map(|o| o.name.as_str()).unwrap_or(id)
    }
}

/// 單一來源的抓取結果
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFetch {
    pub source_id: SourceId,
    pub label: String,
    pub dataset_id: String,
    pub values: Vec<RawDataValue>,
    pub used_fallback: bool,
    pub failed_org_units: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedData {
    pub period: String,
    pub sources: Vec<SourceFetch>,
    pub org_unit_names: HashMap<String, String>,
    pub org_unit_levels: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub status: String,
    pub imported: u64,
    pub updated: u64,
    pub ignored: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Skipped,
    Blocked { errors: usize },
    Published(ImportSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_name: String,
    pub period: String,
    pub generated_at: DateTime<Utc>,
    pub comparison: ComparisonReport,
    pub validation: Vec<ValidationResult>,
    pub fallback_sources: Vec<String>,
    pub failed_org_units: Vec<String>,
    /// 原始值只供寫出歷史檔與發佈使用，不放進報表 JSON
    #[serde(skip)]
    pub sources: Vec<SourceFetch>,
    pub publish: PublishOutcome,
}

impl RunReport {
    pub fn blocking_failures(&self) -> usize {
        self.validation.iter().filter(|r| r.is_blocking()).count()
    }

    pub fn all_raw_values(&self) -> Vec<RawDataValue> {
        self.sources
            .iter()
            .flat_map(|s| s.values.iter().cloned())
            .collect()
    }
}
