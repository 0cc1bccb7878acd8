use std::fmt;
use thiserror::Error;

/// DHIS2 抓取失敗的種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    AuthFailed,
    NotFound,
    Timeout,
    ServerError,
}

impl FetchErrorKind {
    /// 依 HTTP 狀態碼分類
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => FetchErrorKind::AuthFailed,
            404 => FetchErrorKind::NotFound,
            408 | 504 => FetchErrorKind::Timeout,
            _ => FetchErrorKind::ServerError,
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchErrorKind::AuthFailed => "auth failed",
            FetchErrorKind::NotFound => "not found",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::ServerError => "server error",
        };
        f.write_str(label)
    }
}

/// 執行流程中的階段，用於頂層錯誤訊息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Fetch,
    Compare,
    Publish,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStage::Fetch => "fetch",
            RunStage::Compare => "compare",
            RunStage::Publish => "publish",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("CSV export error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Fetch failed ({kind}): {message}")]
    FetchError { kind: FetchErrorKind, message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error(
        "No data found for dataset '{dataset}' in org units [{org_units}] \
         for period '{period}'"
    )]
    NoDataError {
        dataset: String,
        org_units: String,
        period: String,
    },

    #[error(
        "Analytics fallback failed for dataset '{dataset}' in org units [{org_units}] \
         for period '{period}': {reason}"
    )]
    FallbackFetchError {
        dataset: String,
        org_units: String,
        period: String,
        reason: String,
    },

    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: RunStage,
        #[source]
        source: Box<ReconError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Configuration,
    Data,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ReconError {
    pub fn fetch(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        ReconError::FetchError {
            kind,
            message: message.into(),
        }
    }

    pub fn in_stage(self, stage: RunStage) -> Self {
        match self {
            // 已包裝或取消的錯誤不再重複包裝
            ReconError::StageFailed { .. } | ReconError::Cancelled => self,
            other => ReconError::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// 取得最內層的錯誤 (去除階段包裝)
    pub fn root(&self) -> &ReconError {
        match self {
            ReconError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            ReconError::HttpError(_) | ReconError::FetchError { .. } => ErrorCategory::Network,
            ReconError::FallbackFetchError { .. } => ErrorCategory::Network,
            ReconError::ConfigError { .. }
            | ReconError::ConfigValidationError { .. }
            | ReconError::MissingConfigError { .. }
            | ReconError::InvalidConfigValueError { .. } => ErrorCategory::Configuration,
            ReconError::NoDataError { .. }
            | ReconError::ProcessingError { .. }
            | ReconError::CsvError(_)
            | ReconError::SerializationError(_) => ErrorCategory::Data,
            ReconError::IoError(_) | ReconError::Cancelled | ReconError::StageFailed { .. } => {
                ErrorCategory::System
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.root() {
            ReconError::Cancelled => ErrorSeverity::Low,
            ReconError::FetchError { kind, .. } => match kind {
                FetchErrorKind::AuthFailed => ErrorSeverity::High,
                _ => ErrorSeverity::Medium,
            },
            ReconError::HttpError(_)
            | ReconError::FallbackFetchError { .. }
            | ReconError::NoDataError { .. } => ErrorSeverity::Medium,
            ReconError::IoError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// 網路類錯誤可由外層排程重試，核心本身不重試
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            ReconError::FetchError { kind, .. } => {
                matches!(kind, FetchErrorKind::Timeout | FetchErrorKind::ServerError)
            }
            ReconError::HttpError(_) | ReconError::FallbackFetchError { .. } => true,
            _ => false,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self.root() {
            ReconError::FetchError { kind, .. } => match kind {
                FetchErrorKind::AuthFailed => {
                    "Check the instance username/password \
                     (or the environment variables they reference)"
                        .to_string()
                }
                FetchErrorKind::NotFound => {
                    "Verify the dataset, org unit and period identifiers exist on the instance"
                        .to_string()
                }
                FetchErrorKind::Timeout => {
                    "Increase fetch_timeout_seconds or reduce concurrent_requests".to_string()
                }
                FetchErrorKind::ServerError => {
                    "The DHIS2 server returned an error; retry later or check server logs"
                        .to_string()
                }
            },
            ReconError::HttpError(_) => {
                "Check network connectivity to the DHIS2 instance".to_string()
            }
            ReconError::NoDataError { .. } => {
                "Confirm data has been entered for this period, or pick another period".to_string()
            }
            ReconError::FallbackFetchError { .. } => {
                "Both dataValueSets and analytics failed; \
                 check that analytics tables have been generated"
                    .to_string()
            }
            ReconError::ConfigError { .. }
            | ReconError::ConfigValidationError { .. }
            | ReconError::MissingConfigError { .. }
            | ReconError::InvalidConfigValueError { .. } => {
                "Fix the configuration file and run again".to_string()
            }
            ReconError::IoError(_) => "Check file permissions and available disk space".to_string(),
            ReconError::Cancelled => "The run was cancelled; start it again when ready".to_string(),
            _ => "Inspect the logs (run with --verbose) for details".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            ReconError::StageFailed { stage, source } => {
                format!("Run failed during {}: {}", stage, source.user_friendly_message())
            }
            ReconError::FetchError { kind, message } => {
                format!("Could not fetch data from DHIS2 ({}): {}", kind, message)
            }
            ReconError::NoDataError { dataset, org_units, period } => format!(
                "No data was found for {} in {} for {}",
                dataset, org_units, period
            ),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
