use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::TabularStore;
use crate::error::TransportError;
use crate::grid::{CellUpdate, Grid, SheetRef};

const API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Google Sheets v4 REST client authenticated with an OAuth access token.
pub struct SheetsClient {
    access_token: String,
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest {
    value_input_option: &'static str,
    data: Vec<BatchUpdateRange>,
}

#[derive(Debug, Serialize)]
struct BatchUpdateRange {
    range: String,
    values: [[String; 1]; 1],
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl SheetsClient {
    pub fn new(access_token: String) -> Result<Self, TransportError> {
        Self::with_base_url(access_token, API_URL)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(access_token: String, base_url: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Malformed(format!("invalid base url {base_url}: {e}")))?;
        Ok(Self {
            access_token,
            client,
            base_url,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Malformed(format!("base url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Maps quota and error statuses; passes successful responses through.
    async fn check(response: Response) -> Result<Response, TransportError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(TransportError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(TransportError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl TabularStore for SheetsClient {
    async fn get_sheet_names(&self, spreadsheet_id: &str) -> Result<Vec<String>, TransportError> {
        let url = self.url(&[spreadsheet_id])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&[("fields", "sheets.properties.title")])
            .send()
            .await?;
        let meta: SpreadsheetMeta = Self::check(response).await?.json().await?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn read_range(&self, sheet: &SheetRef, a1_range: &str) -> Result<Grid, TransportError> {
        let range = sheet.range(a1_range);
        let url = self.url(&[&sheet.spreadsheet_id, "values", &range])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: ValueRange = Self::check(response).await?.json().await?;
        debug!(range = %range, rows = body.values.len(), "range read");
        Ok(Grid::from_rows(
            body.values
                .into_iter()
                .map(|row| row.into_iter().map(cell_text).collect())
                .collect(),
        ))
    }

    async fn batch_update(&self, sheet: &SheetRef, updates: &[CellUpdate]) -> Result<(), TransportError> {
        let url = self.url(&[&sheet.spreadsheet_id, "values:batchUpdate"])?;
        let body = BatchUpdateRequest {
            value_input_option: "RAW",
            data: updates
                .iter()
                .map(|u| BatchUpdateRange {
                    range: sheet.range(&u.a1()),
                    values: [[u.value.clone()]],
                })
                .collect(),
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(sheet = %sheet.sheet_name, cells = updates.len(), "batch update sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sheet() -> SheetRef {
        SheetRef::new("book", "Sheet1")
    }

    async fn client(server: &MockServer) -> SheetsClient {
        SheetsClient::with_base_url("token".into(), &server.uri()).unwrap()
    }

    #[tokio::test]
    async fn lists_sheet_titles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .and(query_param("fields", "sheets.properties.title"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sheets": [
                    {"properties": {"title": "Sheet1"}},
                    {"properties": {"title": "Archive"}}
                ]
            })))
            .mount(&server)
            .await;

        let names = client(&server).await.get_sheet_names("book").await.unwrap();
        assert_eq!(names, vec!["Sheet1", "Archive"]);
    }

    #[tokio::test]
    async fn reads_ragged_values_into_grid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/book/values/.*A1:Z10$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "range": "Sheet1!A1:Z10",
                "majorDimension": "ROWS",
                "values": [["作業指示行", "コピー"], ["1"], [2, true]]
            })))
            .mount(&server)
            .await;

        let grid = client(&server).await.read_range(&sheet(), "A1:Z10").await.unwrap();
        assert_eq!(grid.height(), 3);
        assert_eq!(grid.width(), 2);
        assert_eq!(grid.cell(0, 1), "コピー");
        assert_eq!(grid.cell(1, 1), "");
        assert_eq!(grid.cell(2, 0), "2");
        assert_eq!(grid.cell(2, 1), "true");
    }

    #[tokio::test]
    async fn empty_range_has_no_values_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/book/values/.*B5$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "range": "Sheet1!B5",
                "majorDimension": "ROWS"
            })))
            .mount(&server)
            .await;

        let grid = client(&server).await.read_range(&sheet(), "B5").await.unwrap();
        assert_eq!(grid.height(), 0);
        assert_eq!(grid.cell(0, 0), "");
    }

    #[tokio::test]
    async fn batch_update_sends_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/book/values:batchUpdate"))
            .and(body_partial_json(serde_json::json!({
                "valueInputOption": "RAW",
                "data": [
                    {"range": "'Sheet1'!B5", "values": [["処理済み"]]},
                    {"range": "'Sheet1'!E5", "values": [["result"]]}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .batch_update(
                &sheet(),
                &[CellUpdate::new(4, 1, "処理済み"), CellUpdate::new(4, 4, "result")],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn quota_response_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client(&server).await.read_range(&sheet(), "A1").await.unwrap_err();
        assert_eq!(err, TransportError::RateLimited { retry_after_ms: 7000 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn permission_error_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("caller lacks permission"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .batch_update(&sheet(), &[CellUpdate::new(0, 1, "x")])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Api {
                status: 403,
                message: "caller lacks permission".into()
            }
        );
        assert!(!err.is_retryable());
    }
}
