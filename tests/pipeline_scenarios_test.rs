use anyhow::Result;
use async_trait::async_trait;
use dhis2_recon::adapters::{load_history, LocalStorage};
use dhis2_recon::core::fetch::FetchPolicy;
use dhis2_recon::core::pipeline::RunSettings;
use dhis2_recon::core::validation::ValidationEngine;
use dhis2_recon::domain::model::{
    Dhis2Instance, ElementRef, ImportSummary, LogicalElementGroup, OrgUnitInfo, RawDataValue,
    RecordStatus, ResolvedNames, RuleType, RunReport, Severity, SourceDescriptor, ValidationRule,
};
use dhis2_recon::domain::ports::{DataPublisher, FetchAdapter, Storage};
use dhis2_recon::{ComparisonPipeline, ReconEngine};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 記憶體內的 DHIS2：以 (dataset, org unit) 查資料
#[derive(Clone, Default)]
struct InMemoryDhis2 {
    values: HashMap<(String, String), Vec<RawDataValue>>,
    levels: HashMap<String, u32>,
    published: Arc<Mutex<Vec<RawDataValue>>>,
}

impl InMemoryDhis2 {
    fn with_value(mut self, dataset: &str, de: &str, ou: &str, v: &str) -> Self {
        self.values
            .entry((dataset.to_string(), ou.to_string()))
            .or_default()
            .push(RawDataValue::new(de, ou, "202401", Some(v)));
        self
    }
}

#[async_trait]
impl FetchAdapter for InMemoryDhis2 {
    async fn fetch_data_values(
        &self,
        source: &SourceDescriptor,
        org_unit: &str,
        _period: &str,
    ) -> dhis2_recon::Result<Vec<RawDataValue>> {
        Ok(self
            .values
            .get(&(source.dataset_id.clone(), org_unit.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_analytics(
        &self,
        _source: &SourceDescriptor,
        _element_ids: &[String],
        _org_units: &[String],
        _period: &str,
    ) -> dhis2_recon::Result<Vec<RawDataValue>> {
        Ok(vec![])
    }

    async fn resolve_names(
        &self,
        _source: &SourceDescriptor,
        _org_units: &[String],
        _period: &str,
    ) -> dhis2_recon::Result<ResolvedNames> {
        Ok(ResolvedNames {
            dataset_name: None,
            org_units: self
                .levels
                .iter()
                .map(|(id, level)| {
                    (
                        id.clone(),
                        OrgUnitInfo {
                            name: id.clone(),
                            level: Some(*level),
                        },
                    )
                })
                .collect(),
            period_name: None,
        })
    }
}

#[async_trait]
impl DataPublisher for InMemoryDhis2 {
    async fn publish(
        &self,
        _destination: &SourceDescriptor,
        values: &[RawDataValue],
    ) -> dhis2_recon::Result<ImportSummary> {
        self.published.lock().await.extend_from_slice(values);
        Ok(ImportSummary {
            status: "SUCCESS".to_string(),
            imported: values.len() as u64,
            ..Default::default()
        })
    }
}

fn source(id: &str, dataset: &str, position: usize) -> SourceDescriptor {
    SourceDescriptor {
        id: id.to_string(),
        label: format!("dataset{}", position),
        instance: Dhis2Instance {
            id: "memory".to_string(),
            base_url: "http://memory.invalid".to_string(),
            username: "admin".to_string(),
            password: "district".to_string(),
            timeout_seconds: None,
        },
        dataset_id: dataset.to_string(),
    }
}

fn group(id: &str, elements: &[(&str, &str)]) -> LogicalElementGroup {
    LogicalElementGroup {
        id: id.to_string(),
        logical_name: id.to_string(),
        elements: elements
            .iter()
            .map(|(source, de)| (source.to_string(), Some(ElementRef::new(*de))))
            .collect(),
    }
}

fn rule(id: &str, rule_type: RuleType, elements: &[&str]) -> ValidationRule {
    ValidationRule {
        id: id.to_string(),
        name: id.to_string(),
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

fn settings(org_units: &[&str], consensus_min_sources: Option<usize>) -> RunSettings {
    RunSettings {
        name: "scenario".to_string(),
        period: "202401".to_string(),
        org_units: org_units.iter().map(|s| s.to_string()).collect(),
        policy: FetchPolicy::default(),
        consensus_min_sources,
        publish_enabled: true,
    }
}

async fn run(pipeline: ComparisonPipeline<InMemoryDhis2>) -> dhis2_recon::Result<RunReport> {
    ReconEngine::new(pipeline).run(&CancellationToken::new()).await
}

#[tokio::test]
async fn test_outlier_uses_history_from_storage() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = LocalStorage::new(temp_dir.path());
    let history: Vec<RawDataValue> = ["10", "11", "9", "10", "10"]
        .into_iter()
        .map(|v| RawDataValue::new("A", "OU1", "202312", Some(v)))
        .collect();
    storage
        .write_file("history/raw_values.json", &serde_json::to_vec(&history)?)
        .await?;

    let adapter = InMemoryDhis2::default().with_value("DS1", "A", "OU1", "50");
    let mut outlier = rule("spike", RuleType::Outlier, &["A"]);
    outlier.threshold = Some(3.0);
    let build = |adapter: InMemoryDhis2| {
        ComparisonPipeline::new(
            adapter,
            settings(&["OU1"], None),
            vec![source("hmis", "DS1", 1)],
            vec![group("anc1", &[("hmis", "A")])],
            ValidationEngine::new(vec![outlier.clone()]),
        )
    };

    let loaded = load_history(&storage, "history/raw_values.json").await?;
    let report = run(build(adapter.clone()).with_history(loaded)).await?;
    let result = &report.validation[0];
    assert!(!result.passed);
    assert_eq!(result.expected_value, Some(10.0));

    // 沒有歷史資料時只剩本批的一筆，樣本不足
    let report = run(build(adapter)).await?;
    let result = &report.validation[0];
    assert!(result.passed);
    assert!(result.message.starts_with("Insufficient data"));

    Ok(())
}

#[tokio::test]
async fn test_rules_scoped_by_org_unit_level() -> Result<()> {
    let mut adapter = InMemoryDhis2::default()
        .with_value("DS1", "A", "OU1", "")
        .with_value("DS1", "A", "OU2", "");
    adapter.levels.insert("OU1".to_string(), 4);

    let mut mandatory = rule("facility-only", RuleType::Mandatory, &["A"]);
    mandatory.org_unit_levels = Some(vec![5]);
    let pipeline = ComparisonPipeline::new(
        adapter,
        settings(&["OU1", "OU2"], None),
        vec![source("hmis", "DS1", 1)],
        vec![group("anc1", &[("hmis", "A")])],
        ValidationEngine::new(vec![mandatory]),
    );

    let report = run(pipeline).await?;

    // OU1 是第 4 層被排除；OU2 層級未知照樣檢查
    assert_eq!(report.validation.len(), 1);
    assert_eq!(report.validation[0].org_unit.as_deref(), Some("OU2"));
    assert!(!report.validation[0].passed);
    // 兩個來源值都是空字串 -> 整組略過
    assert_eq!(report.comparison.summary.total_records, 0);

    Ok(())
}

#[tokio::test]
async fn test_consensus_annotated_across_three_sources() -> Result<()> {
    let adapter = InMemoryDhis2::default()
        .with_value("DS1", "A", "OU1", "5")
        .with_value("DS2", "B", "OU1", "5")
        .with_value("DS3", "C", "OU1", "7");
    let pipeline = ComparisonPipeline::new(
        adapter,
        settings(&["OU1"], Some(2)),
        vec![source("s1", "DS1", 1), source("s2", "DS2", 2), source("s3", "DS3", 3)],
        vec![group("anc1", &[("s1", "A"), ("s2", "B"), ("s3", "C")])],
        ValidationEngine::default(),
    );

    let report = run(pipeline).await?;

    let record = &report.comparison.records[0];
    assert_eq!(record.values.len(), 3);
    assert_eq!(record.status, RecordStatus::Mismatch);
    assert_eq!(record.variance, Some(2.0));
    assert_eq!(record.consensus_value.as_deref(), Some("5"));
    assert_eq!(report.comparison.summary.mismatched_records, 1);

    Ok(())
}

#[tokio::test]
async fn test_misconfigured_rule_does_not_stop_the_run() -> Result<()> {
    let adapter = InMemoryDhis2::default()
        .with_value("DS1", "A", "OU1", "4")
        .with_value("DS1", "B", "OU1", "3");
    let destination = source("dest", "DEST", 1);
    let published = adapter.published.clone();

    let mut broken = rule("broken", RuleType::Consistency, &["A"]);
    broken.condition = Some("DE3 > 0".to_string());
    let mut sum = rule("a-ge-b", RuleType::Consistency, &["A", "B"]);
    sum.condition = Some("DE1 >= DE2".to_string());

    let pipeline = ComparisonPipeline::new(
        adapter,
        settings(&["OU1"], None),
        vec![source("hmis", "DS1", 1)],
        vec![group("anc1", &[("hmis", "A")]), group("anc2", &[("hmis", "B")])],
        ValidationEngine::new(vec![broken, sum]),
    )
    .with_destination(destination);

    let report = run(pipeline).await?;

    let broken_results: Vec<_> = report
        .validation
        .iter()
        .filter(|r| r.rule_id == "broken")
        .collect();
    assert_eq!(broken_results.len(), 1);
    assert!(broken_results[0].misconfigured);
    assert!(!broken_results[0].passed);
    assert!(report
        .validation
        .iter()
        .filter(|r| r.rule_id == "a-ge-b")
        .all(|r| r.passed && !r.misconfigured));

    // 設定錯誤的規則是 warning，不擋發佈
    assert_eq!(published.lock().await.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_range_failure_stays_with_its_source() -> Result<()> {
    // A 在 hmis 是 anc1，在 partner 卻是 anc4
    let adapter = InMemoryDhis2::default()
        .with_value("DS1", "A", "OU1", "10")
        .with_value("DS2", "B", "OU1", "10")
        .with_value("DS2", "A", "OU1", "-3");
    let mut range = rule("partner-range", RuleType::Range, &["A"]);
    range.dataset_id = Some("DS2".to_string());
    let pipeline = ComparisonPipeline::new(
        adapter,
        settings(&["OU1"], None),
        vec![source("hmis", "DS1", 1), source("partner", "DS2", 2)],
        vec![
            group("anc1", &[("hmis", "A"), ("partner", "B")]),
            group("anc4", &[("partner", "A")]),
        ],
        ValidationEngine::new(vec![range]),
    );

    let report = run(pipeline).await?;

    assert_eq!(report.validation.len(), 1);
    assert_eq!(report.validation[0].source.as_deref(), Some("dataset2"));
    assert!(!report.validation[0].passed);

    let status = |group: &str| {
        report
            .comparison
            .records
            .iter()
            .find(|r| r.group_id == group)
            .map(|r| r.status)
    };
    assert_eq!(status("anc1"), Some(RecordStatus::Valid));
    assert_eq!(status("anc4"), Some(RecordStatus::OutOfRange));
    assert_eq!(report.comparison.summary.out_of_range_records, 1);

    Ok(())
}
