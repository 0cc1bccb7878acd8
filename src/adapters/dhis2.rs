use crate::domain::model::{
    Dhis2Instance, ImportSummary, OrgUnitInfo, RawDataValue, ResolvedNames, SourceDescriptor,
};
use crate::domain::ports::{DataPublisher, FetchAdapter};
use crate::utils::error::{FetchErrorKind, ReconError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct DataValueSetResponse {
    #[serde(default, rename = "dataValues")]
    data_values: Vec<RawDataValue>,
}

#[derive(Debug, Deserialize)]
struct AnalyticsHeader {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AnalyticsResponse {
    #[serde(default)]
    headers: Vec<AnalyticsHeader>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct DataSetMeta {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrgUnitMeta {
    id: String,
    name: Option<String>,
    level: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OrgUnitList {
    #[serde(default, rename = "organisationUnits")]
    organisation_units: Vec<OrgUnitMeta>,
}

/// 實例沒有設定 `timeout_seconds` 時的單次請求逾時
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// DHIS2 Web API client (Basic auth，每個實例各自的逾時設定)
#[derive(Debug, Clone)]
pub struct Dhis2Client {
    client: Client,
}

impl Dhis2Client {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn endpoint(instance: &Dhis2Instance, path: &str) -> Result<Url> {
        let base = format!("{}/", instance.base_url.trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|url| url.join(path))
            .map_err(|e| ReconError::InvalidConfigValueError {
                field: format!("instances.{}.base_url", instance.id),
                value: instance.base_url.clone(),
                reason: e.to_string(),
            })
    }

    fn authorized(&self, instance: &Dhis2Instance, request: RequestBuilder) -> RequestBuilder {
        let request = request.basic_auth(&instance.username, Some(&instance.password));
        match instance.timeout_seconds {
            Some(timeout) => request.timeout(Duration::from_secs(timeout)),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        what: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await.map_err(|e| transport_error(what, e))?;
        let status = response.status();
        tracing::debug!("{} -> {}", what, status);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReconError::fetch(
                FetchErrorKind::from_status(status),
                format!("{} returned {}: {}", what, status, truncate(&body, 200)),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            ReconError::fetch(
                FetchErrorKind::ServerError,
                format!("{} returned a malformed body: {}", what, e),
            )
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        instance: &Dhis2Instance,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = Self::endpoint(instance, path)?;
        let what = format!("GET {}", url.path());
        let request = self.authorized(instance, self.client.get(url).query(query));
        self.send_json(&what, request).await
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> ReconError {
    let kind = if e.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::ServerError
    };
    ReconError::fetch(kind, format!("{} failed: {}", what, e))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// 依 headers 欄位位置把 analytics rows 轉成 RawDataValue
fn analytics_rows(response: AnalyticsResponse) -> Result<Vec<RawDataValue>> {
    let position = |name: &str| {
        response
            .headers
            .iter()
            .position(|h| h.name == name)
            .ok_or_else(|| {
                ReconError::fetch(
                    FetchErrorKind::ServerError,
                    format!("analytics response is missing the '{}' column", name),
                )
            })
    };
    let (dx, ou, pe, value) = (
        position("dx")?,
        position("ou")?,
        position("pe")?,
        position("value")?,
    );

    let values = response
        .rows
        .iter()
        .filter_map(|row| {
            Some(RawDataValue {
                data_element: cell_text(row.get(dx)?)?,
                org_unit: cell_text(row.get(ou)?)?,
                period: cell_text(row.get(pe)?)?,
                category_option_combo: None,
                value: row.get(value).and_then(cell_text),
                last_updated: None,
            })
        })
        .collect();
    Ok(values)
}

/// 新舊版 DHIS2 的匯入摘要位置不同：頂層或包在 `response` 裡
fn import_summary(body: &Value) -> ImportSummary {
    let root = body
        .get("response")
        .filter(|r| r.get("importCount").is_some())
        .unwrap_or(body);
    let count = |key: &str| {
        root.get("importCount")
            .and_then(|c| c.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    ImportSummary {
        status: root
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        imported: count("imported"),
        updated: count("updated"),
        ignored: count("ignored"),
        deleted: count("deleted"),
    }
}

#[async_trait]
impl FetchAdapter for Dhis2Client {
    async fn fetch_data_values(
        &self,
        source: &SourceDescriptor,
        org_unit: &str,
        period: &str,
    ) -> Result<Vec<RawDataValue>> {
        let response: DataValueSetResponse = self
            .get_json(
                &source.instance,
                "api/dataValueSets.json",
                &[
                    ("dataSet", source.dataset_id.clone()),
                    ("orgUnit", org_unit.to_string()),
                    ("period", period.to_string()),
                ],
            )
            .await?;
        Ok(response.data_values)
    }

    async fn fetch_analytics(
        &self,
        source: &SourceDescriptor,
        element_ids: &[String],
        org_units: &[String],
        period: &str,
    ) -> Result<Vec<RawDataValue>> {
        if element_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response: AnalyticsResponse = self
            .get_json(
                &source.instance,
                "api/analytics.json",
                &[
                    ("dimension", format!("dx:{}", element_ids.join(";"))),
                    ("dimension", format!("ou:{}", org_units.join(";"))),
                    ("dimension", format!("pe:{}", period)),
                    ("skipMeta", "true".to_string()),
                ],
            )
            .await?;
        analytics_rows(response)
    }

    async fn resolve_names(
        &self,
        source: &SourceDescriptor,
        org_units: &[String],
        _period: &str,
    ) -> Result<ResolvedNames> {
        let dataset: DataSetMeta = self
            .get_json(
                &source.instance,
                &format!("api/dataSets/{}.json", source.dataset_id),
                &[("fields", "id,name".to_string())],
            )
            .await?;

        let units: OrgUnitList = self
            .get_json(
                &source.instance,
                "api/organisationUnits.json",
                &[
                    ("filter", format!("id:in:[{}]", org_units.join(","))),
                    ("fields", "id,name,level".to_string()),
                    ("paging", "false".to_string()),
                ],
            )
            .await?;

        let org_units: HashMap<String, OrgUnitInfo> = units
            .organisation_units
            .into_iter()
            .map(|ou| {
                let name = ou.name.unwrap_or_else(|| ou.id.clone());
                (ou.id, OrgUnitInfo { name, level: ou.level })
            })
            .collect();

        Ok(ResolvedNames {
            dataset_name: dataset.name,
            org_units,
            period_name: None,
        })
    }
}

#[async_trait]
impl DataPublisher for Dhis2Client {
    async fn publish(
        &self,
        destination: &SourceDescriptor,
        values: &[RawDataValue],
    ) -> Result<ImportSummary> {
        let url = Self::endpoint(&destination.instance, "api/dataValueSets.json")?;
        let what = format!("POST {}", url.path());
        let body = serde_json::json!({
            "dataSet": destination.dataset_id,
            "dataValues": values,
        });
        let request = self.authorized(&destination.instance, self.client.post(url).json(&body));

        let response: Value = self.send_json(&what, request).await?;
        let summary = import_summary(&response);
        tracing::info!(
            "📦 Import {}: {} imported, {} updated, {} ignored",
            summary.status,
            summary.imported,
            summary.updated,
            summary.ignored
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    // admin:district
    const AUTH: &str = "Basic YWRtaW46ZGlzdHJpY3Q=";

    fn source(server: &MockServer) -> SourceDescriptor {
        SourceDescriptor {
            id: "hmis".to_string(),
            label: "dataset1".to_string(),
            instance: Dhis2Instance {
                id: "main".to_string(),
                base_url: server.base_url(),
                username: "admin".to_string(),
                password: "district".to_string(),
                timeout_seconds: Some(5),
            },
            dataset_id: "DS1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_data_values_parses_items() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/dataValueSets.json")
                    .query_param("dataSet", "DS1")
                    .query_param("orgUnit", "OU1")
                    .query_param("period", "202401")
                    .header("Authorization", AUTH);
                then.status(200).json_body(json!({
                    "dataSet": "DS1",
                    "dataValues": [
                        {"dataElement": "A", "orgUnit": "OU1", "period": "202401",
                         "categoryOptionCombo": "COC1", "value": "12", "storedBy": "admin"},
                        {"dataElement": "B", "orgUnit": "OU1", "period": "202401", "value": ""}
                    ]
                }));
            })
            .await;

        let client = Dhis2Client::new().unwrap();
        let values = client
            .fetch_data_values(&source(&server), "OU1", "202401")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value.as_deref(), Some("12"));
        assert_eq!(values[0].category_option_combo.as_deref(), Some("COC1"));
        assert_eq!(values[1].present_value(), None);
    }

    #[tokio::test]
    async fn test_empty_data_value_set() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dataValueSets.json");
                then.status(200).json_body(json!({}));
            })
            .await;

        let values = Dhis2Client::new()
            .unwrap()
            .fetch_data_values(&source(&server), "OU1", "202401")
            .await
            .unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_status_codes_map_to_fetch_kinds() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/dataValueSets.json")
                    .query_param("orgUnit", "OU1");
                then.status(401).body("Unauthorized");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/dataValueSets.json")
                    .query_param("orgUnit", "OU2");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/dataValueSets.json")
                    .query_param("orgUnit", "OU3");
                then.status(500);
            })
            .await;

        let client = Dhis2Client::new().unwrap();
        let src = source(&server);
        let kind = |r: Result<Vec<RawDataValue>>| match r {
            Err(ReconError::FetchError { kind, .. }) => kind,
            other => panic!("unexpected result: {other:?}"),
        };

        let ou1 = client.fetch_data_values(&src, "OU1", "202401").await;
        let ou2 = client.fetch_data_values(&src, "OU2", "202401").await;
        let ou3 = client.fetch_data_values(&src, "OU3", "202401").await;
        assert_eq!(kind(ou1), FetchErrorKind::AuthFailed);
        assert_eq!(kind(ou2), FetchErrorKind::NotFound);
        assert_eq!(kind(ou3), FetchErrorKind::ServerError);
    }

    #[tokio::test]
    async fn test_client_timeout_applies_without_instance_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dataValueSets.json");
                then.status(200)
                    .delay(Duration::from_secs(3))
                    .json_body(json!({"dataValues": []}));
            })
            .await;

        let http = Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let mut src = source(&server);
        src.instance.timeout_seconds = None;

        let result = Dhis2Client::with_client(http)
            .fetch_data_values(&src, "OU1", "202401")
            .await;

        match result {
            Err(ReconError::FetchError { kind, .. }) => assert_eq!(kind, FetchErrorKind::Timeout),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_analytics_rows_follow_header_positions() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/analytics.json")
                    .query_param("dimension", "dx:A;B")
                    .query_param("dimension", "ou:OU1;OU2")
                    .query_param("dimension", "pe:202401")
                    .query_param("skipMeta", "true");
                then.status(200).json_body(json!({
                    "headers": [
                        {"name": "ou"}, {"name": "dx"}, {"name": "pe"}, {"name": "value"}
                    ],
                    "rows": [
                        ["OU1", "A", "202401", "15"],
                        ["OU2", "B", "202401", 7]
                    ]
                }));
            })
            .await;

        let values = Dhis2Client::new()
            .unwrap()
            .fetch_analytics(
                &source(&server),
                &["A".to_string(), "B".to_string()],
                &["OU1".to_string(), "OU2".to_string()],
                "202401",
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(values[0], RawDataValue::new("A", "OU1", "202401", Some("15")));
        assert_eq!(values[1], RawDataValue::new("B", "OU2", "202401", Some("7")));
    }

    #[tokio::test]
    async fn test_resolve_names() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dataSets/DS1.json");
                then.status(200).json_body(json!({"id": "DS1", "name": "ANC Monthly"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/organisationUnits.json")
                    .query_param("filter", "id:in:[OU1,OU2]")
                    .query_param("paging", "false");
                then.status(200).json_body(json!({
                    "organisationUnits": [
                        {"id": "OU1", "name": "Kisumu HC", "level": 4}
                    ]
                }));
            })
            .await;

        let names = Dhis2Client::new()
            .unwrap()
            .resolve_names(&source(&server), &["OU1".to_string(), "OU2".to_string()], "202401")
            .await
            .unwrap();

        assert_eq!(names.dataset_name.as_deref(), Some("ANC Monthly"));
        assert_eq!(names.org_unit_name("OU1"), "Kisumu HC");
        assert_eq!(names.org_units["OU1"].level, Some(4));
        assert_eq!(names.org_unit_name("OU2"), "OU2");
    }

    #[tokio::test]
    async fn test_publish_reads_nested_import_count() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/dataValueSets.json")
                    .header("Authorization", AUTH)
                    .json_body_partial(r#"{"dataSet": "DS1"}"#);
                then.status(200).json_body(json!({
                    "httpStatus": "OK",
                    "response": {
                        "status": "SUCCESS",
                        "importCount": {"imported": 2, "updated": 1, "ignored": 0, "deleted": 0}
                    }
                }));
            })
            .await;

        let summary = Dhis2Client::new()
            .unwrap()
            .publish(
                &source(&server),
                &[
                    RawDataValue::new("A", "OU1", "202401", Some("1")),
                    RawDataValue::new("B", "OU1", "202401", Some("2")),
                ],
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(summary.status, "SUCCESS");
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.updated, 1);
    }

    #[test]
    fn test_import_summary_at_top_level() {
        let body = json!({"status": "SUCCESS", "importCount": {"imported": 3}});
        let summary = import_summary(&body);
        assert_eq!(summary.status, "SUCCESS");
        assert_eq!(summary.imported, 3);
        assert_eq!(summary.ignored, 0);
    }
}
