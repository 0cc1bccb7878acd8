use crate::domain::model::RunReport;
use crate::domain::ports::{NoProgress, ProgressSink, ReconPipeline};
use crate::utils::error::{ReconError, Result, RunStage};
use tokio_util::sync::CancellationToken;

pub struct ReconEngine<P: ReconPipeline> {
    pipeline: P,
    progress: Box<dyn ProgressSink>,
}

impl<P: ReconPipeline> ReconEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// 依序執行 fetch → compare/validate → publish
    ///
    /// 取消時丟棄部分結果並回傳 `ReconError::Cancelled`。
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let progress = self.progress.as_ref();
        tracing::info!("🚀 Starting reconciliation run");
        progress.on_progress("fetch-start", 0);

        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(ReconError::Cancelled),
            result = self.pipeline.extract(progress) => {
                result.map_err(|e| e.in_stage(RunStage::Fetch))?
            }
        };
        tracing::info!(
            "📥 Fetched {} values from {} sources",
            data.sources.iter().map(|s| s.values.len()).sum::<usize>(),
            data.sources.len()
        );

        if cancel.is_cancelled() {
            return Err(ReconError::Cancelled);
        }
        let mut report = self
            .pipeline
            .transform(data, progress)
            .await
            .map_err(|e| e.in_stage(RunStage::Compare))?;

        report.publish = tokio::select! {
            _ = cancel.cancelled() => return Err(ReconError::Cancelled),
            result = self.pipeline.load(&report) => {
                result.map_err(|e| e.in_stage(RunStage::Publish))?
            }
        };

        progress.on_progress("done", 100);
        tracing::info!(
            "✅ Run finished: {} records, {} validation results",
            report.comparison.summary.total_records,
            report.validation.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        ComparisonReport, FetchedData, PublishOutcome, RawDataValue, SourceFetch,
    };
    use crate::utils::error::FetchErrorKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct StubPipeline {
        fail_fetch: bool,
        slow_fetch: bool,
    }

    #[async_trait]
    impl ReconPipeline for StubPipeline {
        async fn extract(&self, _progress: &dyn ProgressSink) -> Result<FetchedData> {
            if self.slow_fetch {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_fetch {
                return Err(ReconError::fetch(FetchErrorKind::AuthFailed, "401 Unauthorized"));
            }
            Ok(FetchedData {
                period: "202401".to_string(),
                sources: vec![SourceFetch {
                    source_id: "hmis".to_string(),
                    label: "dataset1".to_string(),
                    dataset_id: "DS1".to_string(),
                    values: vec![RawDataValue::new("A", "OU1", "202401", Some("1"))],
                    used_fallback: false,
                    failed_org_units: vec![],
                }],
                ..Default::default()
            })
        }

        async fn transform(
            &self,
            data: FetchedData,
            progress: &dyn ProgressSink,
        ) -> Result<RunReport> {
            progress.on_progress("alignment-done", 70);
            Ok(RunReport {
                run_name: "stub".to_string(),
                period: data.period,
                generated_at: Utc::now(),
                comparison: ComparisonReport::default(),
                validation: vec![],
                fallback_sources: vec![],
                failed_org_units: vec![],
                sources: data.sources,
                publish: PublishOutcome::Skipped,
            })
        }

        async fn load(&self, _report: &RunReport) -> Result<PublishOutcome> {
            Ok(PublishOutcome::Skipped)
        }
    }

    #[tokio::test]
    async fn test_run_reports_progress_milestones() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let recorder = steps.clone();
        let engine = ReconEngine::new(StubPipeline { fail_fetch: false, slow_fetch: false })
            .with_progress(move |step: &str, percent: u8| {
                recorder.lock().unwrap().push((step.to_string(), percent));
            });

        let report = engine.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.period, "202401");
        let steps = steps.lock().unwrap();
        assert_eq!(steps.first().unwrap(), &("fetch-start".to_string(), 0));
        assert_eq!(steps.last().unwrap(), &("done".to_string(), 100));
    }

    #[tokio::test]
    async fn test_fetch_failure_names_stage() {
        let engine = ReconEngine::new(StubPipeline { fail_fetch: true, slow_fetch: false });
        let err = engine.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconError::StageFailed { stage: RunStage::Fetch, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_partial_results() {
        let engine = ReconEngine::new(StubPipeline { fail_fetch: false, slow_fetch: true });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = engine.run(&cancel).await.unwrap_err();
        assert!(matches!(err, ReconError::Cancelled));
    }
}
