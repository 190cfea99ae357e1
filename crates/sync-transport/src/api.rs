use std::{future::Future, sync::Arc, time::Duration};

use reqwest::{RequestBuilder, StatusCode, header::HeaderMap};
use serde::{Serialize, de::DeserializeOwned};
use sync_core::{
    ConversationQuery, ConversationSummary, DashboardStats, MessageEntry, SyncError,
    SyncErrorCategory, classify_http_status,
};
use sync_platform::CredentialSource;
use tracing::{debug, warn};
use url::Url;

use crate::client::join_path;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BODY_PREVIEW: usize = 200;

/// REST collaborator used for authoritative re-fetches and fallback sends.
pub trait SupportApi: Send + Sync + 'static {
    fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, SyncError>> + Send;

    fn message_history(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<MessageEntry>, SyncError>> + Send;

    fn submit_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<MessageEntry, SyncError>> + Send;

    fn fetch_stats(&self) -> impl Future<Output = Result<DashboardStats, SyncError>> + Send;
}

#[derive(Serialize)]
struct SubmitMessageBody<'a> {
    content: &'a str,
}

/// [`SupportApi`] over HTTP with bearer authentication.
#[derive(Clone)]
pub struct HttpSupportApi {
    http: reqwest::Client,
    base: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpSupportApi {
    pub fn new(base: Url, credentials: Arc<dyn CredentialSource>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("supportdesk-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;
        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        join_path(&self.base, segments)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T, SyncError> {
        let token = self.credentials.credential().ok_or_else(|| {
            SyncError::new(
                SyncErrorCategory::Auth,
                "missing_credential",
                format!("no credential available for {operation}"),
            )
        })?;

        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| map_request_error(operation, err))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            warn!(operation, status = status.as_u16(), "support api request rejected");
            return Err(status_error(operation, status, &body, retry_after));
        }

        debug!(operation, status = status.as_u16(), "support api request ok");
        response.json::<T>().await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "http_decode_error",
                format!("{operation} returned an unexpected body: {err}"),
            )
        })
    }
}

impl SupportApi for HttpSupportApi {
    async fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_owned()));
        }
        if let Some(agent_id) = &query.agent_id {
            params.push(("agent_id", agent_id.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let url = self.endpoint(&["api", "conversations"])?;
        self.execute(self.http.get(url).query(&params), "list_conversations")
            .await
    }

    async fn message_history(&self, conversation_id: &str) -> Result<Vec<MessageEntry>, SyncError> {
        let url = self.endpoint(&["api", "conversations", conversation_id, "messages"])?;
        self.execute(self.http.get(url), "message_history").await
    }

    async fn submit_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<MessageEntry, SyncError> {
        let url = self.endpoint(&["api", "conversations", conversation_id, "messages"])?;
        self.execute(
            self.http.post(url).json(&SubmitMessageBody { content }),
            "submit_message",
        )
        .await
    }

    async fn fetch_stats(&self) -> Result<DashboardStats, SyncError> {
        let url = self.endpoint(&["api", "stats"])?;
        self.execute(self.http.get(url), "fetch_stats").await
    }
}

fn map_request_error(operation: &str, err: reqwest::Error) -> SyncError {
    let code = if err.is_timeout() {
        "http_timeout"
    } else {
        "http_request_failed"
    };
    SyncError::new(
        SyncErrorCategory::Network,
        code,
        format!("{operation} request failed: {err}"),
    )
}

fn status_error(
    operation: &str,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> SyncError {
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    let err = SyncError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("{operation} failed with HTTP {}: {preview}", status.as_u16()),
    );
    match retry_after {
        Some(delay) => err.with_retry_after(delay),
        None => err,
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
