//! Provider gateway HTTP client.
//!
//! Speaks a small REST control-plane protocol:
//!
//! - `POST   /v1/{kind}`        create
//! - `GET    /v1/{kind}/{id}`   read
//! - `PATCH  /v1/{kind}/{id}`   update
//! - `DELETE /v1/{kind}/{id}`   delete
//!
//! The client makes a single attempt per call. Retries belong to the plan
//! executor.

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::model::{ResolvedAttributes, ResourceKind};

use super::adapter::{Outputs, ProviderResult};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry-after used when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// A resource as returned by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Physical id.
    pub id: String,
    /// Provisioning status (`creating`, `available`, `failed`, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Live attributes.
    #[serde(default)]
    pub attributes: ResolvedAttributes,
    /// Computed outputs.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Error body returned by the gateway.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    attributes: Vec<String>,
}

/// Create request body.
#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    attributes: &'a ResolvedAttributes,
}

/// Gateway client.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Bearer token.
    token: String,
}

impl GatewayClient {
    /// Creates a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: &str) -> ProviderResult<Self> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(base_url: &str, token: &str, timeout_secs: u64) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns the mapped provider error.
    pub async fn create(
        &self,
        kind: ResourceKind,
        attributes: &ResolvedAttributes,
    ) -> ProviderResult<RemoteResource> {
        let url = format!("{}/v1/{kind}", self.base_url);
        let response = self
            .send(Method::POST, &url, Some(&CreateRequest { attributes }))
            .await?;
        Self::parse(Self::check(response, None).await?).await
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist.
    pub async fn get(&self, kind: ResourceKind, physical_id: &str) -> ProviderResult<RemoteResource> {
        let url = self.resource_url(kind, physical_id);
        let response = self.send::<()>(Method::GET, &url, None).await?;
        Self::parse(Self::check(response, Some(physical_id)).await?).await
    }

    /// Updates a resource in place.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when the gateway rejects the change.
    pub async fn patch(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        delta: &ResolvedAttributes,
    ) -> ProviderResult<RemoteResource> {
        let url = self.resource_url(kind, physical_id);
        let response = self
            .send(Method::PATCH, &url, Some(&CreateRequest { attributes: delta }))
            .await?;
        Self::parse(Self::check(response, Some(physical_id)).await?).await
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns `DependentsExist` while other resources still use it.
    pub async fn delete(&self, kind: ResourceKind, physical_id: &str) -> ProviderResult<()> {
        let url = self.resource_url(kind, physical_id);
        let response = self.send::<()>(Method::DELETE, &url, None).await?;
        Self::check(response, Some(physical_id)).await?;
        Ok(())
    }

    fn resource_url(&self, kind: ResourceKind, physical_id: &str) -> String {
        format!("{}/v1/{kind}/{physical_id}", self.base_url)
    }

    /// Sends one request.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> ProviderResult<Response> {
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))
    }

    /// Maps non-success statuses to provider errors.
    async fn check(response: Response, physical_id: Option<&str>) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or(ErrorBody {
            message: text,
            attributes: Vec::new(),
        });

        debug!("Gateway returned {status}: {}", body.message);

        let physical_id = physical_id.unwrap_or_default().to_string();
        Err(match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound { physical_id },
            StatusCode::CONFLICT => ProviderError::DependentsExist {
                physical_id,
                message: body.message,
            },
            StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Unsupported {
                attributes: body.attributes,
            },
            StatusCode::BAD_REQUEST => ProviderError::InvalidRequest { message: body.message },
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
                retry_after_secs: retry_after.filter(|s| *s > 0).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            },
            StatusCode::SERVICE_UNAVAILABLE => ProviderError::NotYetVisible { message: body.message },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::AuthenticationFailed {
                    message: String::from("Invalid provider token"),
                }
            }
            _ if body.message.contains("not yet visible") => {
                ProviderError::NotYetVisible { message: body.message }
            }
            _ => ProviderError::api_error(status.as_u16(), body.message),
        })
    }

    async fn parse(response: Response) -> ProviderResult<RemoteResource> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attrs() -> ResolvedAttributes {
        ResolvedAttributes::from([(String::from("cidr"), Value::from("10.0.0.0/16"))])
    }

    #[tokio::test]
    async fn test_create_sends_token_and_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/network"))
            .and(header_eq("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "vpc-123",
                "status": "available",
                "outputs": { "id": "vpc-123" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(&server.uri(), "secret").unwrap();
        let created = client.create(ResourceKind::Network, &attrs()).await.unwrap();

        assert_eq!(created.id, "vpc-123");
        assert_eq!(created.outputs["id"], Value::from("vpc-123"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/database/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/network/vpc-1"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "message": "subnets in use" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/database/db-1"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "attributes": ["engine"] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/secret"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let client = GatewayClient::new(&server.uri(), "t").unwrap();

        assert_eq!(
            client.get(ResourceKind::Database, "gone").await.unwrap_err(),
            ProviderError::NotFound {
                physical_id: String::from("gone")
            }
        );
        assert_eq!(
            client.delete(ResourceKind::Network, "vpc-1").await.unwrap_err(),
            ProviderError::DependentsExist {
                physical_id: String::from("vpc-1"),
                message: String::from("subnets in use")
            }
        );
        assert_eq!(
            client
                .patch(ResourceKind::Database, "db-1", &attrs())
                .await
                .unwrap_err(),
            ProviderError::Unsupported {
                attributes: vec![String::from("engine")]
            }
        );
        assert_eq!(
            client.create(ResourceKind::Secret, &attrs()).await.unwrap_err(),
            ProviderError::RateLimited { retry_after_secs: 12 }
        );
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cluster/c-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("not yet visible"))
            .mount(&server)
            .await;

        let client = GatewayClient::new(&server.uri(), "t").unwrap();
        let err = client.get(ResourceKind::Cluster, "c-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = GatewayClient::new(&server.uri(), "bad").unwrap();
        let err = client.delete(ResourceKind::Function, "fn-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed { .. }));
        assert!(!err.is_transient());
    }
}
