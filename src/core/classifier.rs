use crate::domain::model::{parse_number, AlignedRecord, ComparisonSummary, RecordStatus};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub status: RecordStatus,
    pub variance: Option<f64>,
}

/// 依各來源的值判定狀態
///
/// 順序很重要：先以原始字串比對 (完全相同即 valid)，數值差距只是 mismatch 的附註。
/// 只有一個來源有值時無法互相印證，仍判為 missing。
pub fn classify(values: &[Option<&str>]) -> Classification {
    let present: Vec<&str> = values
        .iter()
        .filter_map(|v| *v)
        .filter(|v| !v.is_empty())
        .collect();

    if present.len() < 2 {
        return Classification {
            status: RecordStatus::Missing,
            variance: None,
        };
    }

    let unique: HashSet<&str> = present.iter().copied().collect();
    if unique.len() == 1 {
        return Classification {
            status: RecordStatus::Valid,
            variance: None,
        };
    }

    Classification {
        status: RecordStatus::Mismatch,
        variance: numeric_spread(&present),
    }
}

/// max - min, only when every present value is numeric
fn numeric_spread(present: &[&str]) -> Option<f64> {
    let numbers: Vec<f64> = present
        .iter()
        .map(|v| parse_number(v))
        .collect::<Option<Vec<f64>>>()?;

    let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
    Some(max - min)
}

pub fn classify_record(record: &mut AlignedRecord) {
    let result = classify(&record.value_slots());
    record.status = result.status;
    record.variance = result.variance;
}

/// 統計各狀態筆數；total 一定等於四個桶的總和
pub fn summarize(records: &[AlignedRecord]) -> ComparisonSummary {
    let mut summary = ComparisonSummary {
        total_records: records.len(),
        ..Default::default()
    };

    for record in records {
        match record.status {
            // consensus 是 valid 的強化版，沒有獨立的桶
            RecordStatus::Valid | RecordStatus::Consensus => summary.valid_records += 1,
            RecordStatus::Mismatch => summary.mismatched_records += 1,
            RecordStatus::Missing => summary.missing_records += 1,
            RecordStatus::OutOfRange => summary.out_of_range_records += 1,
        }
    }

    summary
}

/// 多數決：最常見的值若至少有 `min_sources` 個來源同意則回傳
pub fn majority_value(values: &[Option<&str>], min_sources: usize) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values.iter().filter_map(|v| *v).filter(|v| !v.is_empty()) {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let best = counts.iter().map(|(_, c)| *c).max()?;
    let leaders: Vec<&str> = counts
        .iter()
        .filter(|(_, c)| *c == best)
        .map(|(v, _)| *v)
        .collect();

    // 平手時不選
    if best >= min_sources && leaders.len() == 1 {
        Some(leaders[0].to_string())
    } else {
        None
    }
}
