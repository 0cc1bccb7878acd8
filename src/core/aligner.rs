use crate::core::classifier::classify_record;
use crate::domain::model::{
    AlignedRecord, FetchedData, LogicalElementGroup, RawDataValue, RecordStatus, SourceId,
    SourceValue,
};
use std::collections::{HashMap, HashSet};

/// 來源在輸出中的位置與標籤
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSlot {
    pub id: SourceId,
    pub label: String,
}

impl SourceSlot {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
        }
    }
}

type CellKey<'a> = (&'a str, &'a str, &'a str);

/// 依 (org unit, period, data element) 建索引，同一鍵只保留第一筆
fn index_values(values: &[RawDataValue]) -> HashMap<CellKey<'_>, &RawDataValue> {
    let mut index = HashMap::new();
    for value in values {
        index
            .entry((
                value.org_unit.as_str(),
                value.period.as_str(),
                value.data_element.as_str(),
            ))
            .or_insert(value);
    }
    index
}

/// Builds one classified record per logical group and org-unit/period.
///
/// Groups whose value is absent in every source are skipped. Each record
/// carries exactly one entry per slot in `source_order`, in that order.
pub fn align(
    groups: &[LogicalElementGroup],
    source_order: &[SourceSlot],
    raw_by_source: &HashMap<SourceId, Vec<RawDataValue>>,
    org_unit_names: &HashMap<String, String>,
) -> Vec<AlignedRecord> {
    let empty: Vec<RawDataValue> = Vec::new();
    let source_values: Vec<&Vec<RawDataValue>> = source_order
        .iter()
        .map(|slot| raw_by_source.get(&slot.id).unwrap_or(&empty))
        .collect();
    let indexes: Vec<HashMap<CellKey<'_>, &RawDataValue>> =
        source_values.iter().map(|values| index_values(values)).collect();

    // org unit / period 依首次出現的順序
    let mut seen = HashSet::new();
    let mut cells: Vec<(&str, &str)> = Vec::new();
    for values in &source_values {
        for value in values.iter() {
            let key = (value.org_unit.as_str(), value.period.as_str());
            if seen.insert(key) {
                cells.push(key);
            }
        }
    }

    let mut records = Vec::new();
    for (org_unit, period) in cells {
        for group in groups {
            let values: Vec<SourceValue> = source_order
                .iter()
                .zip(indexes.iter())
                .map(|(slot, index)| {
                    let element_id = group.element_for(&slot.id).map(|e| e.id.clone());
                    let value = element_id
                        .as_deref()
                        .and_then(|de| index.get(&(org_unit, period, de)))
                        .and_then(|raw| raw.present_value())
                        .map(str::to_string);
                    SourceValue {
                        label: slot.label.clone(),
                        element_id,
                        value,
                    }
                })
                .collect();

            if values.iter().all(|v| v.value.is_none()) {
                continue;
            }
            debug_assert_eq!(values.len(), source_order.len());

            let mut record = AlignedRecord {
                group_id: group.id.clone(),
                logical_name: group.logical_name.clone(),
                org_unit: org_unit.to_string(),
                org_unit_name: org_unit_names
                    .get(org_unit)
                    .cloned()
                    .unwrap_or_else(|| org_unit.to_string()),
                period: period.to_string(),
                values,
                status: RecordStatus::Missing,
                variance: None,
                consensus_value: None,
            };
            classify_record(&mut record);
            records.push(record);
        }
    }

    tracing::debug!(
        "🔗 Aligned {} records from {} groups across {} sources",
        records.len(),
        groups.len(),
        source_order.len()
    );
    records
}

/// 直接從抓取結果對齊
pub fn align_fetched(groups: &[LogicalElementGroup], data: &FetchedData) -> Vec<AlignedRecord> {
    let slots: Vec<SourceSlot> = data
        .sources
        .iter()
        .map(|s| SourceSlot::new(&s.source_id, &s.label))
        .collect();
    let raw_by_source: HashMap<SourceId, Vec<RawDataValue>> = data
        .sources
        .iter()
        .map(|s| (s.source_id.clone(), s.values.clone()))
        .collect();
    align(groups, &slots, &raw_by_source, &data.org_unit_names)
}
