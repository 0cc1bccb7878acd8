use crate::adapters::report_writer::OutputFormat;
use crate::core::fetch::{FetchPolicy, DEFAULT_CONCURRENT_REQUESTS, DEFAULT_FETCH_TIMEOUT};
use crate::core::pipeline::RunSettings;
use crate::domain::model::{
    Dhis2Instance, ElementRef, LogicalElementGroup, SourceDescriptor, ValidationRule,
};
use crate::utils::error::{ReconError, Result};
use crate::utils::validation::{
    validate_file_extensions, validate_non_empty_string, validate_path, validate_positive_number,
    validate_range, validate_required_field, validate_unique_ids, validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const MAX_SOURCES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run: RunSection,
    pub instances: Vec<Dhis2Instance>,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
    pub outlier: Option<OutlierConfig>,
    pub destination: Option<DestinationConfig>,
    pub output: OutputConfig,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    pub name: String,
    pub period: Option<String>,
    #[serde(default)]
    pub org_units: Vec<String>,
    pub concurrent_requests: Option<usize>,
    pub fetch_timeout_seconds: Option<u64>,
    pub consensus_min_sources: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub label: Option<String>,
    pub instance: String,
    pub dataset: String,
}

/// `elements` 以來源 id 對應 data element id；沒列出的來源代表該來源沒有這個指標
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    pub logical_name: String,
    #[serde(default)]
    pub elements: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlierConfig {
    pub history_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub instance: String,
    pub dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
}

fn default_formats() -> Vec<String> {
    vec!["json".to_string(), "csv".to_string()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl RunConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(ReconError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 帳密等敏感資訊以環境變數帶入
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| ReconError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${DHIS2_PASSWORD})，未設定的保留原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ReconError::ConfigError {
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 命令列參數覆寫設定檔
    pub fn apply_overrides(
        &mut self,
        period: Option<String>,
        org_units: Option<Vec<String>>,
        output: Option<String>,
    ) {
        if let Some(period) = period {
            self.run.period = Some(period);
        }
        if let Some(org_units) = org_units.filter(|o| !o.is_empty()) {
            self.run.org_units = org_units;
        }
        if let Some(output) = output {
            self.output.path = output;
        }
    }

    pub fn instance(&self, id: &str) -> Result<&Dhis2Instance> {
        self.instances
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ReconError::InvalidConfigValueError {
                field: "instance".to_string(),
                value: id.to_string(),
                reason: "No [[instances]] entry with this id".to_string(),
            })
    }

    /// 依設定順序建立來源；未給 label 時用 dataset1、dataset2…
    pub fn source_descriptors(&self) -> Result<Vec<SourceDescriptor>> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                Ok(SourceDescriptor {
                    id: source.id.clone(),
                    label: source
                        .label
                        .clone()
                        .unwrap_or_else(|| format!("dataset{}", index + 1)),
                    instance: self.instance(&source.instance)?.clone(),
                    dataset_id: source.dataset.clone(),
                })
            })
            .collect()
    }

    pub fn element_groups(&self) -> Vec<LogicalElementGroup> {
        self.groups
            .iter()
            .map(|group| LogicalElementGroup {
                id: group.id.clone(),
                logical_name: group.logical_name.clone(),
                elements: self
                    .sources
                    .iter()
                    .map(|s| (s.id.clone(), group.elements.get(&s.id).map(ElementRef::new)))
                    .collect(),
            })
            .collect()
    }

    pub fn destination_descriptor(&self) -> Result<Option<SourceDescriptor>> {
        self.destination
            .as_ref()
            .map(|dest| {
                Ok(SourceDescriptor {
                    id: "destination".to_string(),
                    label: "destination".to_string(),
                    instance: self.instance(&dest.instance)?.clone(),
                    dataset_id: dest.dataset.clone(),
                })
            })
            .transpose()
    }

    pub fn history_file(&self) -> Option<&str> {
        self.outlier.as_ref().and_then(|o| o.history_file.as_deref())
    }

    pub fn output_formats(&self) -> Vec<OutputFormat> {
        self.output
            .formats
            .iter()
            .filter_map(|f| match f.as_str() {
                "json" => Some(OutputFormat::Json),
                "csv" => Some(OutputFormat::Csv),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            concurrent_requests: self
                .run
                .concurrent_requests
                .unwrap_or(DEFAULT_CONCURRENT_REQUESTS),
            timeout: self
                .run
                .fetch_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FETCH_TIMEOUT),
        }
    }

    pub fn run_settings(&self, publish_enabled: bool) -> Result<RunSettings> {
        let period = validate_required_field("run.period", &self.run.period)?;
        Ok(RunSettings {
            name: self.run.name.clone(),
            period: period.clone(),
            org_units: self.run.org_units.clone(),
            policy: self.fetch_policy(),
            consensus_min_sources: self.run.consensus_min_sources,
            publish_enabled,
        })
    }

    pub fn log_level(&self) -> Option<&str> {
        self.monitoring.as_ref().and_then(|m| m.log_level.as_deref())
    }

    pub fn json_logs(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.log_format.as_deref())
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("run.name", &self.run.name)?;
        let period = validate_required_field("run.period", &self.run.period)?;
        validate_non_empty_string("run.period", period)?;
        if self.run.org_units.is_empty() {
            return Err(ReconError::MissingConfigError {
                field: "run.org_units".to_string(),
            });
        }
        if let Some(concurrent) = self.run.concurrent_requests {
            validate_positive_number("run.concurrent_requests", concurrent, 1)?;
        }
        if let Some(timeout) = self.run.fetch_timeout_seconds {
            validate_positive_number("run.fetch_timeout_seconds", timeout as usize, 1)?;
        }

        validate_unique_ids("instances.id", self.instances.iter().map(|i| i.id.as_str()))?;
        for instance in &self.instances {
            validate_url(&format!("instances.{}.base_url", instance.id), &instance.base_url)?;
            validate_non_empty_string(
                &format!("instances.{}.username", instance.id),
                &instance.username,
            )?;
        }

        validate_range("sources", self.sources.len(), 1, MAX_SOURCES)?;
        validate_unique_ids("sources.id", self.sources.iter().map(|s| s.id.as_str()))?;
        for source in &self.sources {
            self.instance(&source.instance)?;
            validate_non_empty_string(&format!("sources.{}.dataset", source.id), &source.dataset)?;
        }
        if let Some(min_sources) = self.run.consensus_min_sources {
            validate_range("run.consensus_min_sources", min_sources, 1, self.sources.len())?;
        }

        validate_unique_ids("groups.id", self.groups.iter().map(|g| g.id.as_str()))?;
        for group in &self.groups {
            if group.elements.is_empty() {
                return Err(ReconError::ConfigValidationError {
                    field: format!("groups.{}.elements", group.id),
                    message: "A group must map at least one source".to_string(),
                });
            }
            for source_id in group.elements.keys() {
                if !self.sources.iter().any(|s| &s.id == source_id) {
                    return Err(ReconError::InvalidConfigValueError {
                        field: format!("groups.{}.elements", group.id),
                        value: source_id.clone(),
                        reason: "Unknown source id".to_string(),
                    });
                }
            }
        }

        validate_unique_ids("rules.id", self.rules.iter().map(|r| r.id.as_str()))?;

        if let Some(dest) = &self.destination {
            self.instance(&dest.instance)?;
            validate_non_empty_string("destination.dataset", &dest.dataset)?;
        }

        if let Some(history) = self.history_file() {
            validate_path("outlier.history_file", history)?;
            validate_file_extensions("outlier.history_file", &[history.to_string()], &["json"])?;
        }

        validate_path("output.path", &self.output.path)?;
        let valid_formats = ["json", "csv"];
        for format in &self.output.formats {
            if !valid_formats.contains(&format.as_str()) {
                return Err(ReconError::InvalidConfigValueError {
                    field: "output.formats".to_string(),
                    value: format.clone(),
                    reason: format!(
                        "Unsupported format. Valid formats: {}",
                        valid_formats.join(", ")
                    ),
                });
            }
        }

        Ok(())
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
