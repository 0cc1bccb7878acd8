use crate::domain::model::{AlignedRecord, RawDataValue, RunReport};
use crate::domain::ports::Storage;
use crate::utils::error::{ReconError, Result};
use serde::{Deserialize, Serialize};

pub const COMPARISON_JSON: &str = "comparison.json";
pub const COMPARISON_CSV: &str = "comparison.csv";
pub const VALIDATION_JSON: &str = "validation.json";
pub const RAW_VALUES_JSON: &str = "raw_values.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
}

/// 把一次執行的結果寫到 Storage
///
/// `raw_values.json` 不論格式設定都會寫出，下一次執行可拿來當 outlier 的歷史資料。
pub struct ReportWriter<S: Storage> {
    storage: S,
    formats: Vec<OutputFormat>,
}

impl<S: Storage> ReportWriter<S> {
    pub fn new(storage: S, formats: Vec<OutputFormat>) -> Self {
        Self { storage, formats }
    }

    /// 回傳實際寫出的檔名
    pub async fn write(&self, report: &RunReport) -> Result<Vec<String>> {
        let mut written = Vec::new();

        if self.formats.contains(&OutputFormat::Json) {
            let comparison = serde_json::to_vec_pretty(&report.comparison)?;
            self.storage.write_file(COMPARISON_JSON, &comparison).await?;
            written.push(COMPARISON_JSON.to_string());

            let validation = serde_json::to_vec_pretty(&report.validation)?;
            self.storage.write_file(VALIDATION_JSON, &validation).await?;
            written.push(VALIDATION_JSON.to_string());
        }

        if self.formats.contains(&OutputFormat::Csv) {
            let labels: Vec<String> = report.sources.iter().map(|s| s.label.clone()).collect();
            let csv_data = comparison_csv(&labels, &report.comparison.records)?;
            self.storage.write_file(COMPARISON_CSV, &csv_data).await?;
            written.push(COMPARISON_CSV.to_string());
        }

        let raw = serde_json::to_vec_pretty(&report.all_raw_values())?;
        self.storage.write_file(RAW_VALUES_JSON, &raw).await?;
        written.push(RAW_VALUES_JSON.to_string());

        tracing::debug!("💾 Wrote {} output files", written.len());
        Ok(written)
    }
}

fn comparison_csv(labels: &[String], records: &[AlignedRecord]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<&str> =
        vec!["group_id", "logical_name", "org_unit", "org_unit_name", "period"];
    header.extend(labels.iter().map(String::as_str));
    header.extend(["status", "variance", "consensus_value"]);
    wtr.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.group_id.clone(),
            record.logical_name.clone(),
            record.org_unit.clone(),
            record.org_unit_name.clone(),
            record.period.clone(),
        ];
        row.extend(
            labels
                .iter()
                .map(|label| record.value_for(label).unwrap_or_default().to_string()),
        );
        row.push(record.status.as_str().to_string());
        row.push(record.variance.map(|v| v.to_string()).unwrap_or_default());
        row.push(record.consensus_value.clone().unwrap_or_default());
        wtr.write_record(&row)?;
    }

    wtr.into_inner().map_err(|e| ReconError::ProcessingError {
        message: format!("Failed to flush CSV: {}", e),
    })
}

/// 讀取先前執行寫出的 raw_values.json
pub async fn load_history<S: Storage>(storage: &S, path: &str) -> Result<Vec<RawDataValue>> {
    let data = storage.read_file(path).await?;
    let values: Vec<RawDataValue> = serde_json::from_slice(&data)?;
    tracing::info!("📚 Loaded {} historical values from {}", values.len(), path);
    Ok(values)
}
