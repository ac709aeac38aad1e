//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! HTTP control relay towards the OpenDTU limit and power endpoints.

use std::time::Duration;

use async_trait::async_trait;
use dtu_common::config::{DeviceConfig, TransportConfig};
use dtu_core::control::{CommandSink, ControlCommand};
use dtu_core::CoreError;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid device url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device rejected {endpoint} with status {status}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
}

impl From<RelayError> for CoreError {
    fn from(err: RelayError) -> Self {
        CoreError::Relay(err.to_string())
    }
}

/// Posts control commands as `data=<json>` forms with basic auth.
#[derive(Debug, Clone)]
pub struct HttpControlRelay {
    client: Client,
    base: Url,
    username: String,
    password: Option<String>,
}

impl HttpControlRelay {
    pub fn new(device: &DeviceConfig, transport: &TransportConfig) -> Result<Self> {
        let base = Url::parse(&device.http_base())?;
        Ok(Self::with_base(base, transport.request_timeout)?
            .with_credentials(&device.username, device.password.as_deref()))
    }

    pub fn with_base(base: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            username: String::new(),
            password: None,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: Option<&str>) -> Self {
        self.username = username.to_owned();
        self.password = password.map(str::to_owned);
        self
    }

    pub async fn send(&self, command: &ControlCommand) -> Result<()> {
        let endpoint = command.endpoint();
        let url = self.base.join(endpoint)?;
        let payload = command.payload().to_string();
        debug!(serial = %command.serial, action = command.action.as_str(), %payload, "posting control command");

        let mut request = self.client.post(url).form(&[("data", payload)]);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, self.password.as_ref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status { endpoint, status });
        }
        Ok(())
    }
}

#[async_trait]
impl CommandSink for HttpControlRelay {
    async fn dispatch(&self, command: &ControlCommand) -> dtu_core::Result<()> {
        self.send(command).await.map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Form, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use dtu_core::control::ControlAction;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(String, Option<String>, Value)>>>;

    async fn capture(
        State(seen): State<Captured>,
        headers: HeaderMap,
        uri: axum::http::Uri,
        Form(form): Form<HashMap<String, String>>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let data = form
            .get("data")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        seen.lock().push((uri.path().to_owned(), auth, data));
        StatusCode::OK
    }

    async fn serve(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn posts_form_encoded_commands_with_basic_auth() {
        let seen: Captured = Arc::default();
        let router = Router::new()
            .route("/api/limit/config", post(capture))
            .route("/api/power/config", post(capture))
            .with_state(seen.clone());
        let base = serve(router).await;
        let relay = HttpControlRelay::with_base(base, Duration::from_secs(2))
            .unwrap()
            .with_credentials("admin", Some("openDTU42"));

        relay
            .send(&ControlCommand {
                serial: "114182912345".into(),
                action: ControlAction::LimitNonPersistentRelative,
                limit_value: Some(50.into()),
            })
            .await
            .unwrap();
        relay
            .send(&ControlCommand {
                serial: "114182912345".into(),
                action: ControlAction::PowerOff,
                limit_value: None,
            })
            .await
            .unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "/api/limit/config");
        assert_eq!(seen[0].1.as_deref(), Some("Basic YWRtaW46b3BlbkRUVTQy"));
        assert_eq!(
            seen[0].2,
            json!({"serial": "114182912345", "limit_type": 1, "limit_value": 50})
        );
        assert_eq!(seen[1].0, "/api/power/config");
        assert_eq!(seen[1].2, json!({"serial": "114182912345", "power": false}));
    }

    #[tokio::test]
    async fn device_errors_surface_as_relay_errors() {
        let router = Router::new().route(
            "/api/power/config",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let base = serve(router).await;
        let relay = HttpControlRelay::with_base(base, Duration::from_secs(2)).unwrap();

        let command = ControlCommand {
            serial: "S1".into(),
            action: ControlAction::Restart,
            limit_value: None,
        };
        let err = relay.send(&command).await.unwrap_err();
        match err {
            RelayError::Status { endpoint, status } => {
                assert_eq!(endpoint, "/api/power/config");
                assert_eq!(status, StatusCode::UNAUTHORIZED);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(matches!(
            relay.dispatch(&command).await,
            Err(CoreError::Relay(_))
        ));
    }
}
