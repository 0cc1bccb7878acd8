use crate::core::classifier::{majority_value, summarize};
use crate::domain::model::{
    AlignedRecord, ComparisonReport, RecordStatus, RuleType, ValidationResult,
};
use std::collections::HashSet;

pub fn build_comparison(records: Vec<AlignedRecord>) -> ComparisonReport {
    let summary = summarize(&records);
    ComparisonReport { records, summary }
}

/// 把 range 規則的失敗結果併入比對結果
///
/// 失敗以 (來源, element, org unit, period) 對應到來源欄位；同一個 element id 在
/// 另一個來源的值不受影響。沒有標註來源的結果對任何來源都算。被改列的紀錄變成
/// out_of_range 並重新計算摘要，回傳被改列的筆數。
pub fn apply_range_failures(report: &mut ComparisonReport, results: &[ValidationResult]) -> usize {
    let failures: HashSet<(Option<&str>, &str, &str, &str)> = results
        .iter()
        .filter(|r| r.rule_type == RuleType::Range && !r.passed && !r.misconfigured)
        .filter_map(|r| {
            Some((
                r.source.as_deref(),
                r.data_element.as_deref()?,
                r.org_unit.as_deref()?,
                r.period.as_deref()?,
            ))
        })
        .collect();

    let mut changed = 0;
    for record in &mut report.records {
        let ou = record.org_unit.as_str();
        let pe = record.period.as_str();
        let hit = record.values.iter().any(|slot| {
            slot.element_id.as_deref().is_some_and(|de| {
                failures.contains(&(Some(slot.label.as_str()), de, ou, pe))
                    || failures.contains(&(None, de, ou, pe))
            })
        });
        if hit && record.status != RecordStatus::OutOfRange {
            record.status = RecordStatus::OutOfRange;
            changed += 1;
        }
    }

    report.summary = summarize(&report.records);
    changed
}

/// 在不一致的紀錄上標註多數決的值；狀態不變
pub fn annotate_consensus(report: &mut ComparisonReport, min_sources: usize) -> usize {
    let mut annotated = 0;
    for record in report
        .records
        .iter_mut()
        .filter(|r| r.status == RecordStatus::Mismatch)
    {
        record.consensus_value = majority_value(&record.value_slots(), min_sources);
        if record.consensus_value.is_some() {
            annotated += 1;
        }
    }
    annotated
}
