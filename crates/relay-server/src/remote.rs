use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use relay_core::errors::PushError;
use relay_core::ids::ConnectionId;
use relay_core::registry::ConnectionRegistry;
use relay_core::wire::OutboundMessage;

/// Pushes frames through a gateway's `@connections` management API.
///
/// `POST {endpoint}/@connections/{id}` delivers a frame and
/// `DELETE {endpoint}/@connections/{id}` closes the connection. A 410 from
/// either means the connection no longer exists.
pub struct HttpRegistry {
    client: Client,
    endpoint: String,
}

impl HttpRegistry {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, PushError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connection_url(&self, id: &ConnectionId) -> String {
        format!(
            "{}/@connections/{}",
            self.endpoint,
            urlencoding::encode(id.as_str())
        )
    }
}

async fn check(resp: reqwest::Response) -> Result<(), PushError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::GONE {
        return Err(PushError::Gone);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PushError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ConnectionRegistry for HttpRegistry {
    async fn push(
        &self,
        connection_id: &ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), PushError> {
        debug!(connection_id = %connection_id, kind = message.kind(), "posting to connection");
        let resp = self
            .client
            .post(self.connection_url(connection_id))
            .header("content-type", "application/json")
            .body(message.to_json())
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        check(resp).await
    }

    async fn delete(&self, connection_id: &ConnectionId) -> Result<(), PushError> {
        let resp = self
            .client
            .delete(self.connection_url(connection_id))
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        check(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_for(server: &MockServer) -> HttpRegistry {
        HttpRegistry::new(&format!("{}/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn push_posts_frame_to_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/@connections/Yb2Q%3D"))
            .and(body_string(r#"{"message":"Hi"}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        assert!(!registry.endpoint().ends_with('/'));
        registry
            .push(&ConnectionId::from_raw("Yb2Q="), &OutboundMessage::content("Hi"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gone_status_maps_to_gone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let id = ConnectionId::from_raw("abc");
        assert_eq!(
            registry.push(&id, &OutboundMessage::Done).await,
            Err(PushError::Gone)
        );
        assert_eq!(registry.delete(&id).await, Err(PushError::Gone));
    }

    #[tokio::test]
    async fn other_failures_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let err = registry
            .push(&ConnectionId::from_raw("abc"), &OutboundMessage::Done)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PushError::Rejected {
                status: 403,
                body: "forbidden".into()
            }
        );
    }

    #[tokio::test]
    async fn delete_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/@connections/abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        registry_for(&server)
            .delete(&ConnectionId::from_raw("abc"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let registry = HttpRegistry::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = registry
            .push(&ConnectionId::from_raw("abc"), &OutboundMessage::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Transport(_)));
    }
}
