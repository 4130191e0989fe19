//! Backend REST boundary
//!
//! The sync coordinator replays queued mutations through the [`BackendApi`]
//! trait; the backend itself (auth, CRUD, balance computation) is an external
//! collaborator. [`HttpBackend`] is the production implementation: the same
//! method/path/body an online-first mutation would have used, JSON bodies,
//! bearer auth, and one token refresh before giving up on a 401.
//!
//! Every request carries the mutation's client-generated idempotency key so
//! duplicate replays from different devices can collapse server-side.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::types::{OperationKind, QueuedMutation};

/// Header carrying the client-generated mutation id
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Supplies bearer tokens for backend calls.
///
/// The auth flow itself (login, storage of refresh tokens) is out of scope;
/// the coordinator only needs a current token and a way to refresh it once.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// The current access token
    async fn access_token(&self) -> MeshResult<String>;

    /// Refresh and return a new access token.
    ///
    /// Called after a 401; failure surfaces as `MeshError::Auth`.
    async fn refresh(&self) -> MeshResult<String>;
}

/// A fixed token that cannot be refreshed.
///
/// Useful for tools and tests; a real deployment injects the app's auth
/// collaborator instead.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap a fixed token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> MeshResult<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> MeshResult<String> {
        Err(MeshError::Auth("static token cannot be refreshed".to_string()))
    }
}

/// The replay surface the sync coordinator drains against
#[async_trait::async_trait]
pub trait BackendApi: Send + Sync {
    /// Issue the backend call for one queued mutation.
    ///
    /// `Ok(())` means the backend confirmed the operation; any error leaves
    /// the mutation `Failed` for the next drain pass.
    async fn execute(&self, mutation: &QueuedMutation) -> MeshResult<()>;
}

/// Production backend client over HTTP
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpBackend {
    /// Create a client for the given API root, e.g. `https://api.example.com/v1`
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    fn method_for(op: OperationKind) -> reqwest::Method {
        match op {
            OperationKind::Create => reqwest::Method::POST,
            OperationKind::Update => reqwest::Method::PATCH,
            OperationKind::Delete => reqwest::Method::DELETE,
        }
    }

    fn url_for(&self, resource_path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            resource_path.trim_start_matches('/')
        )
    }

    async fn attempt(&self, mutation: &QueuedMutation, token: &str) -> MeshResult<reqwest::StatusCode> {
        let mut request = self
            .client
            .request(Self::method_for(mutation.op), self.url_for(&mutation.resource_path))
            .bearer_auth(token)
            .header(IDEMPOTENCY_HEADER, mutation.idempotency_key.as_str());

        if mutation.op != OperationKind::Delete {
            request = request.json(&mutation.body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MeshError::ReplayFailed(e.to_string()))?;
        Ok(response.status())
    }
}

#[async_trait::async_trait]
impl BackendApi for HttpBackend {
    async fn execute(&self, mutation: &QueuedMutation) -> MeshResult<()> {
        let token = self.tokens.access_token().await?;
        let status = self.attempt(mutation, &token).await?;

        if status.is_success() {
            debug!(id = mutation.id, path = %mutation.resource_path, "Replay confirmed");
            return Ok(());
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            // One refresh, one retry; repeated 401 is an auth problem, not a
            // transient replay failure
            debug!(id = mutation.id, "Replay got 401, refreshing token");
            let token = self.tokens.refresh().await?;
            let status = self.attempt(mutation, &token).await?;
            if status.is_success() {
                return Ok(());
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(MeshError::Auth("rejected after token refresh".to_string()));
            }
            warn!(id = mutation.id, %status, "Replay failed after refresh");
            return Err(MeshError::ReplayFailed(format!("status {}", status)));
        }

        warn!(id = mutation.id, %status, "Replay failed");
        Err(MeshError::ReplayFailed(format!("status {}", status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(
            HttpBackend::method_for(OperationKind::Create),
            reqwest::Method::POST
        );
        assert_eq!(
            HttpBackend::method_for(OperationKind::Update),
            reqwest::Method::PATCH
        );
        assert_eq!(
            HttpBackend::method_for(OperationKind::Delete),
            reqwest::Method::DELETE
        );
    }

    #[test]
    fn test_url_joining() {
        let backend = HttpBackend::new(
            "https://api.example.com/v1/",
            Arc::new(StaticTokenSource::new("t")),
        );
        assert_eq!(
            backend.url_for("/groups/g1/expenses"),
            "https://api.example.com/v1/groups/g1/expenses"
        );
        assert_eq!(
            backend.url_for("groups/g1"),
            "https://api.example.com/v1/groups/g1"
        );
    }

    #[tokio::test]
    async fn test_static_token_source() {
        let tokens = StaticTokenSource::new("secret");
        assert_eq!(tokens.access_token().await.unwrap(), "secret");
        assert!(matches!(tokens.refresh().await, Err(MeshError::Auth(_))));
    }
}
