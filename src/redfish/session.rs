// src/redfish/session.rs

//! Redfish HTTP session handling. Grounded on
//! `original_source/lib/redfish.py`'s `open_redfish_session` /
//! `close_redfish_session` and the `redfish_*` verb wrappers.

use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::BootstrapError;

/// An authenticated Redfish session against one BMC. Login is retried
/// (60 attempts, 2s apart) since a freshly-power-cycled BMC's web service
/// can take a couple of minutes to come up.
pub struct Session {
    client: Client,
    host: String,
    token: String,
    session_uri: String,
}

impl Session {
    pub async fn open(host: &str, username: &str, password: &str) -> Result<Self, BootstrapError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        let login_body = serde_json::json!({
            "UserName": username,
            "Password": password,
        });

        for attempt in 1..=60 {
            let url = format!("https://{host}/redfish/v1/SessionService/Sessions");
            match client.post(url.as_str()).json(&login_body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let token = resp
                        .headers()
                        .get("X-Auth-Token")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let session_uri = resp
                        .headers()
                        .get("Location")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    if let (Some(token), Some(session_uri)) = (token, session_uri) {
                        info!("redfish session opened on {}", host);
                        return Ok(Self {
                            client,
                            host: host.to_string(),
                            token,
                            session_uri,
                        });
                    }
                    warn!(
                        "redfish login to {} succeeded without auth headers, retrying ({}/60)",
                        host, attempt
                    );
                }
                Ok(resp) => {
                    warn!(
                        "redfish login to {} returned {} ({}/60)",
                        host,
                        resp.status(),
                        attempt
                    );
                }
                Err(e) => {
                    warn!("redfish login to {} failed: {} ({}/60)", host, e, attempt);
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }

        Err(BootstrapError::Redfish(format!(
            "could not open session against {host} after 60 attempts"
        )))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("https://") {
            return path.to_string();
        }
        format!("https://{}{}", self.host, path)
    }

    pub async fn get(&self, path: &str) -> Result<Option<Value>, BootstrapError> {
        let resp = self
            .client
            .get(self.url(path))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        self.decode(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Option<Value>, BootstrapError> {
        let resp = self
            .client
            .post(self.url(path))
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        self.decode(resp).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Option<Value>, BootstrapError> {
        let resp = self
            .client
            .patch(self.url(path))
            .header("X-Auth-Token", &self.token)
            .json(body)
            .send()
            .await?;
        self.decode(resp).await
    }

    /// Every non-2xx response is logged and yields `None`, never an `Err`
    /// — matching `original_source/lib/redfish.py`'s `get`/`post`/`put`/
    /// `patch`, which check status against `[200, 201(, 204)]` and
    /// otherwise log and return without raising. A single BMC call failing
    /// (e.g. a transient 503 or a setting the target doesn't support)
    /// mustn't abort the whole per-node init sequence.
    async fn decode(&self, resp: reqwest::Response) -> Result<Option<Value>, BootstrapError> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            if let Some(msg) = extract_extended_info(&body) {
                warn!("redfish call to {} returned {}: {}", self.host, status, msg);
            } else {
                warn!("redfish call to {} returned {}", self.host, status);
            }
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Logs out of the BMC session. Fallible cleanup is logged, never
    /// propagated: by the time this is called the bootstrap outcome is
    /// already decided.
    pub async fn close(self) {
        let result = self
            .client
            .delete(self.url(&self.session_uri))
            .header("X-Auth-Token", &self.token)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!("redfish session on {} closed", self.host);
            }
            Ok(resp) => warn!(
                "redfish logout on {} returned {}",
                self.host,
                resp.status()
            ),
            Err(e) => warn!("redfish logout on {} failed: {}", self.host, e),
        }
    }
}

/// Pulls `error.@Message.ExtendedInfo[0].Message` out of a Redfish error
/// body, if present, for friendlier logging.
fn extract_extended_info(body: &Value) -> Option<String> {
    body.get("error")?
        .get("@Message.ExtendedInfo")?
        .get(0)?
        .get("Message")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_session() -> Session {
        Session {
            client: Client::new(),
            host: "bmc.example.test".to_string(),
            token: "token".to_string(),
            session_uri: "/redfish/v1/SessionService/Sessions/1".to_string(),
        }
    }

    fn response_with_status(status: u16, body: Value) -> reqwest::Response {
        let http_response = http::Response::builder()
            .status(status)
            .body(serde_json::to_vec(&body).unwrap())
            .unwrap();
        reqwest::Response::from(http_response)
    }

    #[tokio::test]
    async fn every_non_success_status_decodes_to_none_not_err() {
        let session = test_session();
        for status in [404, 400, 403, 500, 503] {
            let resp = response_with_status(status, json!({}));
            let decoded = session.decode(resp).await.unwrap();
            assert!(decoded.is_none(), "status {status} should decode to None, not Err");
        }
    }

    #[tokio::test]
    async fn success_status_decodes_to_the_response_body() {
        let session = test_session();
        let resp = response_with_status(200, json!({"ok": true}));
        let decoded = session.decode(resp).await.unwrap();
        assert_eq!(decoded, Some(json!({"ok": true})));
    }
}
