//! Request-response transport over HTTP. Stateless: each call is one round
//! trip through `reqwest`, with a client builder, bearer auth and JSON
//! bodies, plus timeout and status-code handling on the request path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{SyncError, SyncResult};
use crate::hlc::HlcTimestamp;
use crate::message::{
    ActionPush, ActionResponse, CheckpointResponse, SyncPull, SyncPush, SyncPushResponse,
    SyncResponse,
};

use super::{ActionCapable, ActionDescriptor, AuthTokenProvider, CheckpointCapable, ConnectorDescriptor, DescribeActionsResponse, SyncTransport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    client: Client,
    base_url: String,
    gateway_id: String,
    auth: Arc<dyn AuthTokenProvider>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, gateway_id: impl Into<String>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            gateway_id: gateway_id.into(),
            auth,
        }
    }

    fn route(&self, suffix: &str) -> String {
        format!("{}/sync/{}/{}", self.base_url.trim_end_matches('/'), self.gateway_id, suffix)
    }

    /// Issue one request, refreshing the token and retrying exactly once on
    /// a 401. A second consecutive 401 surfaces as a `TRANSPORT_ERROR` with
    /// no further retry: the token provider did its job (it produced a
    /// credential, then a fresh one), so the rejection is the server's, not
    /// the provider's.
    async fn send_with_retry<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> SyncResult<reqwest::Response> {
        let mut token = self.auth.token().await?;
        let mut refreshed_once = false;

        loop {
            let mut builder = self.client.request(method.clone(), url).bearer_auth(&token);
            if let Some(b) = body {
                builder = builder.json(b);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                if refreshed_once {
                    return Err(SyncError::Transport(format!(
                        "{method} {url} -> 401 persisted after token refresh"
                    )));
                }
                token = self.auth.refresh().await?;
                refreshed_once = true;
                continue;
            }

            return Ok(response);
        }
    }

    async fn request_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> SyncResult<R> {
        let response = self.send_with_retry(method.clone(), url, body).await?;

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "{} {} -> {}",
                method,
                url,
                response.status()
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, req: SyncPush) -> SyncResult<SyncPushResponse> {
        let url = self.route("push");
        self.request_json(Method::POST, &url, Some(&req)).await
    }

    async fn pull(&self, req: SyncPull) -> SyncResult<SyncResponse> {
        let mut url = format!(
            "{}?since={}&clientId={}&limit={}",
            self.route("pull"),
            req.since_hlc,
            req.client_id,
            req.max_deltas
        );
        if let Some(source) = &req.source {
            url.push_str(&format!("&source={source}"));
        }
        self.request_json::<(), _>(Method::GET, &url, None).await
    }
}

#[async_trait]
impl CheckpointCapable for HttpTransport {
    async fn checkpoint(&self) -> SyncResult<Option<CheckpointResponse>> {
        let url = self.route("checkpoint");
        let response = self.send_with_retry::<()>(Method::GET, &url, None).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "checkpoint -> {}",
                response.status()
            )));
        }
        let body: CheckpointResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if body.deltas.is_empty() && body.snapshot_hlc == HlcTimestamp::ZERO {
            return Ok(None);
        }
        Ok(Some(body))
    }
}

#[async_trait]
impl ActionCapable for HttpTransport {
    async fn execute_action(&self, req: ActionPush) -> SyncResult<ActionResponse> {
        let url = self.route("action");
        self.request_json(Method::POST, &url, Some(&req)).await
    }

    async fn describe_actions(&self) -> SyncResult<DescribeActionsResponse> {
        let url = self.route("action/describe");
        self.request_json::<(), _>(Method::GET, &url, None).await
    }

    async fn list_connector_types(&self) -> SyncResult<Vec<ConnectorDescriptor>> {
        let url = self.route("action/connectors");
        self.request_json::<(), _>(Method::GET, &url, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticToken(String);

    #[async_trait]
    impl AuthTokenProvider for StaticToken {
        async fn token(&self) -> SyncResult<String> {
            Ok(self.0.clone())
        }
    }

    /// Token provider that returns `stale` once then `fresh`, to exercise
    /// the single-refresh-on-401 path.
    struct FlakyToken {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AuthTokenProvider for FlakyToken {
        async fn token(&self) -> SyncResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("stale".into())
        }

        async fn refresh(&self) -> SyncResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("fresh".into())
        }
    }

    #[tokio::test]
    async fn push_success_roundtrips_server_hlc() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sync/gw/push")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"server_hlc":"42","accepted":1}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), "gw", Arc::new(StaticToken("tok".into())));
        let resp = transport
            .push(SyncPush {
                client_id: "c1".into(),
                deltas: vec![],
                last_seen_hlc: HlcTimestamp(1),
            })
            .await
            .unwrap();

        assert_eq!(resp.server_hlc, HlcTimestamp(42));
        assert_eq!(resp.accepted, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn single_401_triggers_one_refresh_then_succeeds_s6() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("POST", "/sync/gw/push")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .create_async()
            .await;
        let _ok = server
            .mock("POST", "/sync/gw/push")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"server_hlc":"1","accepted":0}"#)
            .create_async()
            .await;

        let provider = Arc::new(FlakyToken { calls: AtomicU32::new(0) });
        let transport = HttpTransport::new(server.url(), "gw", Arc::clone(&provider) as Arc<dyn AuthTokenProvider>);
        let resp = transport
            .push(SyncPush::default())
            .await
            .unwrap();

        assert_eq!(resp.accepted, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2, "token() once + refresh() once");
    }

    #[tokio::test]
    async fn second_consecutive_401_surfaces_as_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _always_unauthorized = server
            .mock("POST", "/sync/gw/push")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let provider = Arc::new(StaticToken("tok".into()));
        let transport = HttpTransport::new(server.url(), "gw", provider);
        let err = transport.push(SyncPush::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn checkpoint_204_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/sync/gw/checkpoint")
            .with_status(204)
            .create_async()
            .await;
        let transport = HttpTransport::new(server.url(), "gw", Arc::new(StaticToken("tok".into())));
        let result = transport.checkpoint().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn server_5xx_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/sync/gw/push")
            .with_status(500)
            .create_async()
            .await;
        let transport = HttpTransport::new(server.url(), "gw", Arc::new(StaticToken("tok".into())));
        let err = transport.push(SyncPush::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn checkpoint_refreshes_once_on_401() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("GET", "/sync/gw/checkpoint")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .create_async()
            .await;
        let _ok = server
            .mock("GET", "/sync/gw/checkpoint")
            .match_header("authorization", "Bearer fresh")
            .with_status(204)
            .create_async()
            .await;

        let provider = Arc::new(FlakyToken { calls: AtomicU32::new(0) });
        let transport = HttpTransport::new(server.url(), "gw", Arc::clone(&provider) as Arc<dyn AuthTokenProvider>);
        let result = transport.checkpoint().await.unwrap();

        assert!(result.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2, "token() once + refresh() once");
    }
}
