use crate::core::aligner::align_fetched;
use crate::core::fetch::{fetch_source, resolve_names_or_ids, FetchPolicy};
use crate::core::report::{annotate_consensus, apply_range_failures, build_comparison};
use crate::core::validation::{SampleSource, ValidationEngine};
use crate::domain::model::{
    FetchedData, LogicalElementGroup, PublishOutcome, RawDataValue, RunReport, SourceDescriptor,
};
use crate::domain::ports::{DataPublisher, FetchAdapter, ProgressSink, ReconPipeline};
use crate::utils::error::{Result, RunStage};
use chrono::Utc;
use std::collections::HashSet;

/// 單次執行的參數
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub name: String,
    pub period: String,
    pub org_units: Vec<String>,
    pub policy: FetchPolicy,
    pub consensus_min_sources: Option<usize>,
    pub publish_enabled: bool,
}

/// Fetch → align/classify → validate → publish, against DHIS2 sources.
pub struct ComparisonPipeline<A: FetchAdapter + DataPublisher> {
    adapter: A,
    settings: RunSettings,
    sources: Vec<SourceDescriptor>,
    groups: Vec<LogicalElementGroup>,
    engine: ValidationEngine,
    history: Option<Vec<RawDataValue>>,
    destination: Option<SourceDescriptor>,
}

impl<A: FetchAdapter + DataPublisher> ComparisonPipeline<A> {
    pub fn new(
        adapter: A,
        settings: RunSettings,
        sources: Vec<SourceDescriptor>,
        groups: Vec<LogicalElementGroup>,
        engine: ValidationEngine,
    ) -> Self {
        Self {
            adapter,
            settings,
            sources,
            groups,
            engine,
            history: None,
            destination: None,
        }
    }

    pub fn with_history(mut self, history: Vec<RawDataValue>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_destination(mut self, destination: SourceDescriptor) -> Self {
        self.destination = Some(destination);
        self
    }

    /// 這個來源在各群組中對應到的 element id (去重、保持順序)
    fn element_ids_for(&self, source_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .filter_map(|g| g.element_for(source_id))
            .filter(|e| seen.insert(e.id.clone()))
            .map(|e| e.id.clone())
            .collect()
    }
}

fn fetch_percent(done: usize, total: usize) -> u8 {
    (10 + 50 * done / total.max(1)) as u8
}

#[async_trait::async_trait]
impl<A: FetchAdapter + DataPublisher> ReconPipeline for ComparisonPipeline<A> {
    async fn extract(&self, progress: &dyn ProgressSink) -> Result<FetchedData> {
        let period = &self.settings.period;
        let org_units = &self.settings.org_units;
        let mut data = FetchedData {
            period: period.clone(),
            ..Default::default()
        };

        for (index, source) in self.sources.iter().enumerate() {
            let element_ids = self.element_ids_for(&source.id);
            let fetched = fetch_source(
                &self.adapter,
                source,
                org_units,
                period,
                &element_ids,
                &self.settings.policy,
            )
            .await?;
            progress.on_progress(
                &format!("fetch-done:{}", source.label),
                fetch_percent(index + 1, self.sources.len()),
            );
            data.sources.push(fetched);
        }

        // 名稱以第一個來源的 metadata 為準
        if let Some(primary) = self.sources.first() {
            let timeout = self.settings.policy.timeout;
            let names =
                resolve_names_or_ids(&self.adapter, primary, org_units, period, timeout).await;
            for (id, info) in names.org_units {
                if let Some(level) = info.level {
                    data.org_unit_levels.insert(id.clone(), level);
                }
                data.org_unit_names.insert(id, info.name);
            }
        }

        Ok(data)
    }

    async fn transform(&self, data: FetchedData, progress: &dyn ProgressSink) -> Result<RunReport> {
        let records = align_fetched(&self.groups, &data);
        progress.on_progress("alignment-done", 70);

        let mut comparison = build_comparison(records);
        if let Some(min_sources) = self.settings.consensus_min_sources {
            let annotated = annotate_consensus(&mut comparison, min_sources);
            tracing::debug!("🤝 {} mismatched records have a consensus value", annotated);
        }
        progress.on_progress("classification-done", 80);

        let engine = self
            .engine
            .clone()
            .with_org_unit_levels(data.org_unit_levels.clone());
        let samples = SampleSource::from_history(self.history.as_deref());
        let mut validation = Vec::new();
        for source in &data.sources {
            validation.extend(engine.run_for_source(
                &source.dataset_id,
                &source.label,
                &source.values,
                samples,
            ));
        }
        let rebucketed = apply_range_failures(&mut comparison, &validation);
        progress.on_progress("validation-done", 90);

        let summary = &comparison.summary;
        tracing::info!(
            "📊 {} records: {} valid, {} mismatched, {} missing, {} out of range \
             ({} from range rules)",
            summary.total_records,
            summary.valid_records,
            summary.mismatched_records,
            summary.missing_records,
            summary.out_of_range_records,
            rebucketed
        );

        Ok(RunReport {
            run_name: self.settings.name.clone(),
            period: data.period.clone(),
            generated_at: Utc::now(),
            comparison,
            validation,
            fallback_sources: data
                .sources
                .iter()
                .filter(|s| s.used_fallback)
                .map(|s| s.label.clone())
                .collect(),
            failed_org_units: data
                .sources
                .iter()
                .flat_map(|s| {
                    s.failed_org_units
                        .iter()
                        .map(move |ou| format!("{}:{}", s.label, ou))
                })
                .collect(),
            sources: data.sources,
            publish: PublishOutcome::Skipped,
        })
    }

    async fn load(&self, report: &RunReport) -> Result<PublishOutcome> {
        let destination = self
            .destination
            .as_ref()
            .filter(|_| self.settings.publish_enabled);
        let Some(destination) = destination else {
            return Ok(PublishOutcome::Skipped);
        };

        let errors = report.blocking_failures();
        if errors > 0 {
            tracing::warn!(
                "⛔ Publishing to {} blocked: {} error-severity validation failures",
                destination.dataset_id,
                errors
            );
            return Ok(PublishOutcome::Blocked { errors });
        }

        let Some(primary) = report.sources.first() else {
            return Ok(PublishOutcome::Skipped);
        };
        tracing::info!(
            "📤 Publishing {} values from {} to {} on {}",
            primary.values.len(),
            primary.label,
            destination.dataset_id,
            destination.instance.id
        );
        let summary = self
            .adapter
            .publish(destination, &primary.values)
            .await
            .map_err(|e| e.in_stage(RunStage::Publish))?;
        Ok(PublishOutcome::Published(summary))
    }
}
