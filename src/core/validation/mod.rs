pub mod expression;
pub mod stats;

use crate::domain::model::{RawDataValue, RuleType, Severity, ValidationResult, ValidationRule};
use expression::{Comparison, Condition, ExpressionError};
use stats::{SampleStats, DEFAULT_Z_THRESHOLD, MIN_SAMPLES};
use std::collections::HashMap;
use thiserror::Error;

/// 規則本身設定錯誤；會轉成失敗的 ValidationResult，不會中斷其他規則
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleConfigError {
    #[error("consistency rule has no condition")]
    MissingCondition,
    #[error("cannot evaluate condition '{condition}': {source}")]
    InvalidCondition {
        condition: String,
        #[source]
        source: ExpressionError,
    },
}

/// Where the outlier check draws its comparison sample from.
#[derive(Debug, Clone, Copy)]
pub enum SampleSource<'a> {
    Historical(&'a [RawDataValue]),
    CurrentBatch,
}

impl<'a> SampleSource<'a> {
    /// 有歷史資料就用歷史資料，否則用本批資料
    pub fn from_history(history: Option<&'a [RawDataValue]>) -> Self {
        match history {
            Some(values) if !values.is_empty() => SampleSource::Historical(values),
            _ => SampleSource::CurrentBatch,
        }
    }
}

type CellKey<'a> = (&'a str, &'a str, &'a str);

/// 單次執行的查詢上下文
struct BatchContext<'a> {
    values: &'a [RawDataValue],
    cells: HashMap<CellKey<'a>, &'a RawDataValue>,
    samples: SampleSource<'a>,
}

impl<'a> BatchContext<'a> {
    fn new(values: &'a [RawDataValue], samples: SampleSource<'a>) -> Self {
        let mut cells = HashMap::new();
        for value in values {
            cells
                .entry((
                    value.data_element.as_str(),
                    value.org_unit.as_str(),
                    value.period.as_str(),
                ))
                .or_insert(value);
        }
        Self {
            values,
            cells,
            samples,
        }
    }

    /// 找不到或非數字時視為 0
    fn number_at(&self, data_element: &str, org_unit: &str, period: &str) -> f64 {
        self.cells
            .get(&(data_element, org_unit, period))
            .and_then(|v| v.numeric_value())
            .unwrap_or(0.0)
    }

    fn sample_for(&self, data_element: &str, org_unit: &str) -> Vec<f64> {
        let pool = match self.samples {
            SampleSource::Historical(history) => history,
            SampleSource::CurrentBatch => self.values,
        };
        pool.iter()
            .filter(|v| v.data_element == data_element && v.org_unit == org_unit)
            .filter_map(|v| v.numeric_value())
            .collect()
    }
}

/// Evaluates a fixed set of active rules. Holds no state between runs, so one
/// instance can serve concurrent runs.
#[derive(Debug, Clone, Default)]
pub struct ValidationEngine {
    rules: Vec<ValidationRule>,
    org_unit_levels: HashMap<String, u32>,
}

impl ValidationEngine {
    pub fn new(rules: impl IntoIterator<Item = ValidationRule>) -> Self {
        Self {
            rules: rules.into_iter().filter(|r| r.is_active).collect(),
            org_unit_levels: HashMap::new(),
        }
    }

    pub fn with_org_unit_levels(mut self, levels: HashMap<String, u32>) -> Self {
        self.org_unit_levels = levels;
        self
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// 對所有啟用中的規則執行檢查
    pub fn run(&self, values: &[RawDataValue], samples: SampleSource<'_>) -> Vec<ValidationResult> {
        self.run_rules(self.rules.iter(), values, samples)
    }

    /// 只執行未指定 dataset 或指定為 `dataset_id` 的規則，結果標上來源
    pub fn run_for_source(
        &self,
        dataset_id: &str,
        source_label: &str,
        values: &[RawDataValue],
        samples: SampleSource<'_>,
    ) -> Vec<ValidationResult> {
        let rules = self
            .rules
            .iter()
            .filter(|r| r.dataset_id.as_deref().map_or(true, |d| d == dataset_id));
        let mut results = self.run_rules(rules, values, samples);
        for result in &mut results {
            result.source = Some(source_label.to_string());
        }
        results
    }

    fn run_rules<'r>(
        &self,
        rules: impl Iterator<Item = &'r ValidationRule>,
        values: &[RawDataValue],
        samples: SampleSource<'_>,
    ) -> Vec<ValidationResult> {
        let context = BatchContext::new(values, samples);
        let mut results = Vec::new();

        for rule in rules {
            let before = results.len();
            // 條件只解析一次
            let condition = match rule.rule_type {
                RuleType::Consistency => Some(parse_condition(rule)),
                _ => None,
            };

            for value in values.iter().filter(|v| self.applies_to(rule, v)) {
                let outcome = match rule.rule_type {
                    RuleType::Range => Ok(check_range(rule, value)),
                    RuleType::Mandatory => Ok(check_mandatory(rule, value)),
                    RuleType::Outlier => Ok(check_outlier(rule, value, &context)),
                    RuleType::Consistency => match &condition {
                        Some(Ok(cond)) => Ok(check_consistency(rule, cond, value, &context)),
                        Some(Err(e)) => Err(e.clone()),
                        None => Err(RuleConfigError::MissingCondition),
                    },
                };
                results.push(outcome.unwrap_or_else(|e| misconfigured(rule, value, &e)));
            }

            tracing::debug!(
                "🧪 Rule '{}' ({}) produced {} results",
                rule.name,
                rule.rule_type,
                results.len() - before
            );
        }

        let failed = results.iter().filter(|r| !r.passed).count();
        tracing::info!(
            "🧪 Validation finished: {} checks, {} failed",
            results.len(),
            failed
        );
        results
    }

    fn applies_to(&self, rule: &ValidationRule, value: &RawDataValue) -> bool {
        if !rule.data_elements.iter().any(|de| *de == value.data_element) {
            return false;
        }
        match (&rule.org_unit_levels, self.org_unit_levels.get(&value.org_unit)) {
            (Some(levels), Some(level)) => levels.contains(level),
            // 層級未知時照樣套用
            _ => true,
        }
    }
}

fn parse_condition(rule: &ValidationRule) -> Result<Condition, RuleConfigError> {
    let raw = rule
        .condition
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or(RuleConfigError::MissingCondition)?;
    let invalid = |source| RuleConfigError::InvalidCondition {
        condition: raw.to_string(),
        source,
    };
    let condition = expression::parse(raw).map_err(invalid)?;
    condition
        .check_references(rule.data_elements.len())
        .map_err(invalid)?;
    Ok(condition)
}

fn base_result(
    rule: &ValidationRule,
    value: &RawDataValue,
    passed: bool,
    message: String,
) -> ValidationResult {
    ValidationResult {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        rule_type: rule.rule_type,
        severity: rule.severity,
        passed,
        misconfigured: false,
        message,
        data_element: Some(value.data_element.clone()),
        value: value.value.clone(),
        expected_value: None,
        suggested_fix: None,
        org_unit: Some(value.org_unit.clone()),
        period: Some(value.period.clone()),
        source: None,
    }
}

fn misconfigured(
    rule: &ValidationRule,
    value: &RawDataValue,
    error: &RuleConfigError,
) -> ValidationResult {
    tracing::warn!("⚠️ Rule '{}' is misconfigured: {}", rule.name, error);
    let message = format!("Rule configuration error: {}", error);
    ValidationResult {
        misconfigured: true,
        suggested_fix: Some(format!("Fix the configuration of rule '{}'", rule.id)),
        ..base_result(rule, value, false, message)
    }
}

fn check_range(rule: &ValidationRule, value: &RawDataValue) -> ValidationResult {
    let raw = value.value.as_deref().unwrap_or("");
    let Some(number) = value.numeric_value() else {
        let message = format!("Value '{}' is not a number", raw);
        return ValidationResult {
            suggested_fix: Some("Enter a numeric value".to_string()),
            ..base_result(rule, value, false, message)
        };
    };

    if number < 0.0 {
        // 負值一律視為錯誤
        let message = format!("Negative value {} is not allowed", number);
        return ValidationResult {
            severity: Severity::Error,
            suggested_fix: Some("Negative values are not allowed; correct the entry".to_string()),
            ..base_result(rule, value, false, message)
        };
    }

    if let Some(max) = rule.threshold {
        if number > max {
            let message = format!("Value {} exceeds the maximum of {}", number, max);
            let fix = format!("Verify the entry; the maximum expected value is {}", max);
            return ValidationResult {
                expected_value: Some(max),
                suggested_fix: Some(fix),
                ..base_result(rule, value, false, message)
            };
        }
    }

    let message = format!("Value {} is within range", number);
    base_result(rule, value, true, message)
}

fn check_mandatory(rule: &ValidationRule, value: &RawDataValue) -> ValidationResult {
    let present = value
        .value
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty());
    if present {
        return base_result(rule, value, true, "Mandatory value is present".to_string());
    }
    let message = format!("Mandatory value for {} is missing", value.data_element);
    ValidationResult {
        suggested_fix: Some(format!(
            "Enter a value for {} in org unit {} for period {}",
            value.data_element, value.org_unit, value.period
        )),
        ..base_result(rule, value, false, message)
    }
}

fn check_consistency(
    rule: &ValidationRule,
    condition: &Condition,
    value: &RawDataValue,
    context: &BatchContext<'_>,
) -> ValidationResult {
    let evaluation = condition.evaluate(|index| {
        let data_element = &rule.data_elements[index - 1];
        context.number_at(data_element, &value.org_unit, &value.period)
    });
    let text = rule.condition.as_deref().unwrap_or_default();

    if evaluation.passed {
        let message = format!("Consistency check '{}' passed", text);
        return base_result(rule, value, true, message);
    }

    let message = format!(
        "Consistency check '{}' failed: {} vs {}",
        text, evaluation.left, evaluation.right
    );
    // 加減式的相等檢查，以計算出的那一側當作期望值
    let expected = match condition.op {
        Comparison::Eq if condition.left.is_arithmetic() => Some(evaluation.left),
        Comparison::Eq if condition.right.is_arithmetic() => Some(evaluation.right),
        _ => None,
    };
    let suggested_fix = match expected {
        Some(expected) => format!("Expected {} based on '{}'", expected, text),
        None => format!("Review the values referenced by '{}'", text),
    };

    ValidationResult {
        expected_value: expected,
        suggested_fix: Some(suggested_fix),
        ..base_result(rule, value, false, message)
    }
}

fn check_outlier(
    rule: &ValidationRule,
    value: &RawDataValue,
    context: &BatchContext<'_>,
) -> ValidationResult {
    let Some(number) = value.numeric_value() else {
        let message = "Non-numeric value skipped for outlier detection".to_string();
        return base_result(rule, value, true, message);
    };

    let sample = context.sample_for(&value.data_element, &value.org_unit);
    let stats = match SampleStats::from_samples(&sample) {
        Some(stats) if stats.count >= MIN_SAMPLES => stats,
        _ => {
            return base_result(
                rule,
                value,
                true,
                format!(
                    "Insufficient data for outlier detection ({} samples, need {})",
                    sample.len(),
                    MIN_SAMPLES
                ),
            )
        }
    };

    let threshold = rule.threshold.unwrap_or(DEFAULT_Z_THRESHOLD);
    let z_score = stats.z_score(number);
    if z_score <= threshold {
        let message = format!("Z-score {:.2} is within {}", z_score, threshold);
        return base_result(rule, value, true, message);
    }

    ValidationResult {
        expected_value: Some(stats.mean),
        suggested_fix: Some(format!(
            "Verify the entry; the average over {} samples is {:.2}",
            stats.count, stats.mean
        )),
        ..base_result(
            rule,
            value,
            false,
            format!("Value {} is an outlier (z-score {:.2} > {})", number, z_score, threshold),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, rule_type: RuleType, elements: &[&str]) -> ValidationRule {
        ValidationRule {
            id: id.to_string(),
            name: format!("{} rule", id),
            rule_type,
            data_elements: elements.iter().map(|s| s.to_string()).collect(),
            condition: None,
            threshold: None,
            severity: Severity::Warning,
            dataset_id: None,
            org_unit_levels: None,
            is_active: true,
        }
    }

    fn value(de: &str, v: &str) -> RawDataValue {
        RawDataValue::new(de, "OU1", "202401", Some(v))
    }

    #[test]
    fn test_inactive_rules_are_dropped() {
        let mut inactive = rule("r1", RuleType::Mandatory, &["A"]);
        inactive.is_active = false;
        let engine = ValidationEngine::new(vec![inactive, rule("r2", RuleType::Mandatory, &["A"])]);
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.rules()[0].id, "r2");
    }

    #[test]
    fn test_mandatory_failure_keeps_configured_severity() {
        let mut r = rule("m1", RuleType::Mandatory, &["A"]);
        r.severity = Severity::Info;
        let engine = ValidationEngine::new(vec![r]);

        let results = engine.run(&[value("A", "")], SampleSource::CurrentBatch);
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert_eq!(results[0].severity, Severity::Info);

        let results = engine.run(&[value("A", "  ")], SampleSource::CurrentBatch);
        assert!(!results[0].passed);

        let mut missing = value("A", "x");
        missing.value = None;
        let results = engine.run(&[missing, value("B", "")], SampleSource::CurrentBatch);
        assert_eq!(results.len(), 1); // B 不在規則內
        assert!(!results[0].passed);
    }

    #[test]
    fn test_range_negative_forces_error() {
        let mut r = rule("r1", RuleType::Range, &["A"]);
        r.severity = Severity::Warning;
        let engine = ValidationEngine::new(vec![r]);

        let results = engine.run(&[value("A", "-5")], SampleSource::CurrentBatch);
        assert!(!results[0].passed);
        assert_eq!(results[0].severity, Severity::Error);
    }

    #[test]
    fn test_range_threshold_and_non_numeric() {
        let mut r = rule("r1", RuleType::Range, &["A"]);
        r.threshold = Some(100.0);
        let engine = ValidationEngine::new(vec![r]);

        let results = engine.run(
            &[value("A", "150"), value("A", "abc"), value("A", "100")],
            SampleSource::CurrentBatch,
        );
        assert!(!results[0].passed);
        assert_eq!(results[0].severity, Severity::Warning);
        assert_eq!(results[0].expected_value, Some(100.0));
        assert!(!results[1].passed);
        assert!(results[1].message.contains("not a number"));
        assert!(results[2].passed);
    }

    #[test]
    fn test_consistency_tolerance() {
        let mut r = rule("c1", RuleType::Consistency, &["A", "B", "C"]);
        r.condition = Some("DE1 + DE2 == DE3".to_string());
        let engine = ValidationEngine::new(vec![r]);

        let ok = vec![value("A", "10"), value("B", "5"), value("C", "15.005")];
        let results = engine.run(&ok, SampleSource::CurrentBatch);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed));

        let bad = vec![value("A", "10"), value("B", "5"), value("C", "15.02")];
        let results = engine.run(&bad, SampleSource::CurrentBatch);
        assert!(results.iter().all(|r| !r.passed && !r.misconfigured));
        assert_eq!(results[0].expected_value, Some(15.0));
    }

    #[test]
    fn test_consistency_missing_reference_defaults_to_zero() {
        let mut r = rule("c2", RuleType::Consistency, &["A", "B"]);
        r.condition = Some("DE1 <= DE2".to_string());
        let engine = ValidationEngine::new(vec![r]);

        // B 不存在 → 0
        let results = engine.run(&[value("A", "3")], SampleSource::CurrentBatch);
        assert!(!results[0].passed);
        assert_eq!(results[0].expected_value, None);

        let results = engine.run(&[value("A", "0")], SampleSource::CurrentBatch);
        assert!(results[0].passed);
    }

    #[test]
    fn test_misconfigured_rule_does_not_block_others() {
        let mut broken = rule("c3", RuleType::Consistency, &["A"]);
        broken.condition = Some("DE1 ~ 3".to_string());
        let no_condition = rule("c4", RuleType::Consistency, &["A"]);
        let mandatory = rule("m1", RuleType::Mandatory, &["A"]);
        let engine = ValidationEngine::new(vec![broken, no_condition, mandatory]);

        let results = engine.run(&[value("A", "4")], SampleSource::CurrentBatch);
        assert_eq!(results.len(), 3);
        assert!(results[0].misconfigured && !results[0].passed);
        assert!(results[1].misconfigured);
        assert!(results[1].message.contains("no condition"));
        assert!(results[2].passed && !results[2].misconfigured);
    }

    #[test]
    fn test_outlier_insufficient_data_always_passes() {
        let engine = ValidationEngine::new(vec![rule("o1", RuleType::Outlier, &["A"])]);
        let history = vec![value("A", "10"), value("A", "11")];

        let results = engine.run(&[value("A", "100000")], SampleSource::Historical(&history));
        assert!(results[0].passed);
        assert!(results[0].message.contains("Insufficient data"));
    }

    #[test]
    fn test_outlier_against_history() {
        let mut r = rule("o1", RuleType::Outlier, &["A"]);
        r.threshold = Some(2.0);
        let engine = ValidationEngine::new(vec![r]);
        let history = vec![value("A", "10"), value("A", "12"), value("A", "11"), value("A", "9")];

        let batch = [value("A", "30"), value("A", "11")];
        let results = engine.run(&batch, SampleSource::Historical(&history));
        assert!(!results[0].passed);
        assert_eq!(results[0].expected_value, Some(10.5));
        assert!(results[1].passed);
    }

    #[test]
    fn test_outlier_skips_non_numeric_and_uses_batch() {
        let engine = ValidationEngine::new(vec![rule("o1", RuleType::Outlier, &["A"])]);
        let batch = vec![value("A", "n/a"), value("A", "5"), value("A", "5"), value("A", "5")];
        let results = engine.run(&batch, SampleSource::from_history(None));
        assert!(results.iter().all(|r| r.passed));
        assert!(results[0].message.contains("Non-numeric"));
    }

    #[test]
    fn test_dataset_and_level_scoping() {
        let mut scoped = rule("m1", RuleType::Mandatory, &["A"]);
        scoped.dataset_id = Some("DS_B".to_string());
        let mut leveled = rule("m2", RuleType::Mandatory, &["A"]);
        leveled.org_unit_levels = Some(vec![4]);

        let mut levels = HashMap::new();
        levels.insert("OU1".to_string(), 3);
        let engine = ValidationEngine::new(vec![scoped, leveled]).with_org_unit_levels(levels);

        let batch = [value("A", "")];
        let results = engine.run_for_source("DS_A", "dataset1", &batch, SampleSource::CurrentBatch);
        // m1 屬於其他 dataset，m2 層級不符
        assert!(results.is_empty());

        let results = engine.run_for_source("DS_B", "dataset2", &batch, SampleSource::CurrentBatch);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source.as_deref(), Some("dataset2"));
    }
}
