//! reqwest-backed WMS client. The request timeout set here is what bounds a
//! slow warehouse call for the broker consumers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{SnapshotEntry, SnapshotPage, SnapshotScope, WmsClient, WmsError, WmsOrderAction};

pub struct HttpWmsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntryDto {
    batch_id: String,
    orderable: i32,
    #[serde(default)]
    unallocatable: Option<i32>,
    reported_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponseDto {
    snapshots: Vec<SnapshotEntryDto>,
    #[serde(default)]
    next_token: Option<String>,
}

impl HttpWmsClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WmsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WmsError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    async fn post_action(&self, path: &str, action: &WmsOrderAction) -> Result<(), WmsError> {
        let url = format!("{}{}", self.base_url, path);
        let body = json!({
            "externalBatchId": action.external_batch_id,
            "quantity": action.quantity,
            "orderRef": action.order_ref,
        });

        debug!(url = %url, order_ref = %action.order_ref, "calling WMS");

        let response = self
            .request(self.http.post(&url).json(&body))
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl WmsClient for HttpWmsClient {
    async fn allocate(&self, action: &WmsOrderAction) -> Result<(), WmsError> {
        self.post_action("/allocations", action).await
    }

    async fn release(&self, action: &WmsOrderAction) -> Result<(), WmsError> {
        self.post_action("/releases", action).await
    }

    async fn fetch_snapshots(&self, scope: &SnapshotScope) -> Result<SnapshotPage, WmsError> {
        let url = format!("{}/snapshots", self.base_url);
        let mut request = self.http.get(&url);
        request = match scope {
            SnapshotScope::Batch(external_id) => request.query(&[("batchId", external_id)]),
            SnapshotScope::Incremental(token) => request.query(&[("since", token)]),
            SnapshotScope::Full => request,
        };

        let response = self.request(request).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;

        let dto: SnapshotResponseDto = response.json().await.map_err(|e| WmsError::Rejected {
            status: 200,
            message: format!("snapshot response did not parse: {e}"),
        })?;

        let entries = dto
            .snapshots
            .into_iter()
            .map(|entry| {
                let raw = json!({
                    "batchId": entry.batch_id,
                    "orderable": entry.orderable,
                    "unallocatable": entry.unallocatable,
                    "reportedAt": entry.reported_at,
                });
                SnapshotEntry {
                    wms_batch_id: entry.batch_id,
                    orderable: entry.orderable,
                    unallocatable: entry.unallocatable,
                    reported_at: entry.reported_at,
                    raw,
                }
            })
            .collect();

        Ok(SnapshotPage {
            entries,
            next_token: dto.next_token,
        })
    }
}

fn transport_error(err: reqwest::Error) -> WmsError {
    // Timeouts and connection resets are indistinguishable from a WMS that
    // is momentarily down; requeue and try again later.
    WmsError::Retriable {
        status: None,
        message: err.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, WmsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(WmsError::from_status(code, body))
}
