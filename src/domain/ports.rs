use crate::domain::model::{
    FetchedData, ImportSummary, PublishOutcome, RawDataValue, ResolvedNames, RunReport,
    SourceDescriptor,
};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 對 DHIS2 實例取資料的介面；失敗時回傳 `ReconError::FetchError`
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    /// 明細資料 (dataValueSets)
    async fn fetch_data_values(
        &self,
        source: &SourceDescriptor,
        org_unit: &str,
        period: &str,
    ) -> Result<Vec<RawDataValue>>;

    /// 彙總資料 (analytics)，僅在明細全部為空時使用
    async fn fetch_analytics(
        &self,
        source: &SourceDescriptor,
        element_ids: &[String],
        org_units: &[String],
        period: &str,
    ) -> Result<Vec<RawDataValue>>;

    async fn resolve_names(
        &self,
        source: &SourceDescriptor,
        org_units: &[String],
        period: &str,
    ) -> Result<ResolvedNames>;
}

#[async_trait]
pub trait DataPublisher: Send + Sync {
    async fn publish(
        &self,
        destination: &SourceDescriptor,
        values: &[RawDataValue],
    ) -> Result<ImportSummary>;
}

/// Coarse-grained progress callback. Purely advisory.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, step: &str, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, u8) + Send + Sync,
{
    fn on_progress(&self, step: &str, percent: u8) {
        self(step, percent)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _step: &str, _percent: u8) {}
}

#[async_trait]
pub trait ReconPipeline: Send + Sync {
    async fn extract(&self, progress: &dyn ProgressSink) -> Result<FetchedData>;
    async fn transform(&self, data: FetchedData, progress: &dyn ProgressSink) -> Result<RunReport>;
    async fn load(&self, report: &RunReport) -> Result<PublishOutcome>;
}
