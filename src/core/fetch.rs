use crate::domain::model::{RawDataValue, ResolvedNames, SourceDescriptor, SourceFetch};
use crate::domain::ports::FetchAdapter;
use crate::utils::error::{FetchErrorKind, ReconError, Result};
use futures::stream::{self, StreamExt};
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 4;

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub concurrent_requests: usize,
    pub timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    what: String,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReconError::fetch(
            FetchErrorKind::Timeout,
            format!("{} timed out after {}s", what, timeout.as_secs()),
        )),
    }
}

/// 查不到名稱 (含逾時) 時退回使用 id
pub async fn resolve_names_or_ids<A: FetchAdapter + ?Sized>(
    adapter: &A,
    source: &SourceDescriptor,
    org_units: &[String],
    period: &str,
    timeout: Duration,
) -> ResolvedNames {
    let lookup = with_timeout(
        timeout,
        "metadata lookup".to_string(),
        adapter.resolve_names(source, org_units, period),
    );
    match lookup.await {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!("⚠️ {}: could not resolve metadata names: {}", source.label, e);
            ResolvedNames::default()
        }
    }
}

/// Fetches one source for every org unit, falling back to analytics only when
/// the itemized endpoint yields nothing for any org unit.
///
/// Per-org-unit failures are logged and tolerated. A failed (or empty)
/// fallback ends the run with an error naming the dataset, org units and period.
/// A source with no mapped elements has nothing to ask analytics for and is
/// returned empty.
pub async fn fetch_source<A: FetchAdapter + ?Sized>(
    adapter: &A,
    source: &SourceDescriptor,
    org_units: &[String],
    period: &str,
    element_ids: &[String],
    policy: &FetchPolicy,
) -> Result<SourceFetch> {
    tracing::info!(
        "📡 {}: fetching dataset {} for {} org units, period {}",
        source.label,
        source.dataset_id,
        org_units.len(),
        period
    );

    let mut outcomes: Vec<(usize, String, Result<Vec<RawDataValue>>)> =
        stream::iter(org_units.iter().cloned().enumerate())
            .map(|(index, org_unit)| async move {
                let result = with_timeout(
                    policy.timeout,
                    format!("dataValueSets for {}", org_unit),
                    adapter.fetch_data_values(source, &org_unit, period),
                )
                .await;
                (index, org_unit, result)
            })
            .buffer_unordered(policy.concurrent_requests.max(1))
            .collect()
            .await;
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut values = Vec::new();
    let mut failed_org_units = Vec::new();
    for (_, org_unit, result) in outcomes {
        match result {
            Ok(mut fetched) => {
                tracing::debug!(
                    "📡 {}: {} values from {}",
                    source.label,
                    fetched.len(),
                    org_unit
                );
                values.append(&mut fetched);
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ {}: fetch for org unit {} failed: {}",
                    source.label,
                    org_unit,
                    e
                );
                failed_org_units.push(org_unit);
            }
        }
    }

    if !values.is_empty() {
        return Ok(SourceFetch {
            source_id: source.id.clone(),
            label: source.label.clone(),
            dataset_id: source.dataset_id.clone(),
            values,
            used_fallback: false,
            failed_org_units,
        });
    }

    if element_ids.is_empty() {
        // 沒有對應的 element，analytics 查不到任何東西
        tracing::warn!(
            "⚠️ {}: no data from dataValueSets and no mapped elements; skipping analytics fallback",
            source.label
        );
        return Ok(SourceFetch {
            source_id: source.id.clone(),
            label: source.label.clone(),
            dataset_id: source.dataset_id.clone(),
            values,
            used_fallback: false,
            failed_org_units,
        });
    }

    tracing::info!(
        "🔄 {}: no data from dataValueSets ({} org units failed), falling back to analytics",
        source.label,
        failed_org_units.len()
    );

    let fallback = with_timeout(
        policy.timeout,
        "analytics fallback".to_string(),
        adapter.fetch_analytics(source, element_ids, org_units, period),
    )
    .await;

    match fallback {
        Ok(values) if !values.is_empty() => {
            tracing::info!("✅ {}: analytics returned {} values", source.label, values.len());
            Ok(SourceFetch {
                source_id: source.id.clone(),
                label: source.label.clone(),
                dataset_id: source.dataset_id.clone(),
                values,
                used_fallback: true,
                failed_org_units,
            })
        }
        other => {
            let names =
                resolve_names_or_ids(adapter, source, org_units, period, policy.timeout).await;
            let dataset = names
                .dataset_name
                .clone()
                .unwrap_or_else(|| source.dataset_id.clone());
            let org_unit_list = org_units
                .iter()
                .map(|id| names.org_unit_name(id).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let period_name = names.period_name.clone().unwrap_or_else(|| period.to_string());

            Err(match other {
                Err(e) => ReconError::FallbackFetchError {
                    dataset,
                    org_units: org_unit_list,
                    period: period_name,
                    reason: e.to_string(),
                },
                Ok(_) => ReconError::NoDataError {
                    dataset,
                    org_units: org_unit_list,
                    period: period_name,
                },
            })
        }
    }
}
