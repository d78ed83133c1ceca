use std::fmt;
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header};
use reqwest::header;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, SinkError};
use crate::sink::NotificationSink;

/// Parsed form of an Azure SignalR Service connection string:
/// `Endpoint=https://<name>.service.signalr.net;AccessKey=<key>;Version=1.0;`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Url,
    pub access_key: String,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_key", &"<redacted>")
            .finish()
    }
}

impl FromStr for ConnectionString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut access_key = None;
        let mut port = None;

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Access keys are base64 and may end in '=', only split on the first one.
            let Some((key, value)) = segment.split_once('=') else {
                return Err(invalid(&format!("segment without a value: {segment}")));
            };
            let value = value.trim();

            match key.trim().to_lowercase().as_ref() {
                "endpoint" => endpoint = Some(value),
                "accesskey" => access_key = Some(value),
                "port" => match value.parse::<u16>() {
                    Ok(number) => port = Some(number),
                    Err(_) => return Err(invalid(&format!("invalid port: {value}"))),
                }
                _ => {}
            }
        }

        let Some(endpoint) = endpoint else {
            return Err(invalid("missing Endpoint"));
        };
        let mut endpoint =
            Url::parse(endpoint).map_err(|e| invalid(&format!("invalid Endpoint: {e}")))?;
        if let Some(port) = port {
            if endpoint.set_port(Some(port)).is_err() {
                return Err(invalid(&format!("cannot set port {port} on endpoint")));
            }
        }

        let access_key = access_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| invalid("missing AccessKey"))?;

        Ok(ConnectionString {
            endpoint,
            access_key: access_key.to_owned(),
        })
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::InvalidConnectionString(reason.to_owned())
}

#[derive(Serialize)]
struct Claims<'a> {
    aud: &'a str,
    exp: i64,
}

#[derive(Serialize)]
struct HubMessage<'a> {
    target: &'a str,
    arguments: &'a [String],
}

/// Broadcasts notifications to every client of a hub through the SignalR Service REST API.
pub struct SignalRSink {
    client: reqwest::Client,
    url: Url,
    key: EncodingKey,
    token_ttl: chrono::Duration,
}

impl SignalRSink {
    pub fn new(
        connection: &ConnectionString,
        hub: &str,
        request_timeout: time::Duration,
        token_ttl: chrono::Duration,
    ) -> Result<Self, SinkError> {
        let url = connection
            .endpoint
            .join(&format!("api/v1/hubs/{}", hub.to_lowercase()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("telemetry-relay")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url,
            key: EncodingKey::from_secret(connection.access_key.as_bytes()),
            token_ttl,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mint a short-lived HS256 token whose audience is the hub url.
    fn access_token(&self) -> Result<String, SinkError> {
        let claims = Claims {
            aud: self.url.as_str(),
            exp: (chrono::Utc::now() + self.token_ttl).timestamp(),
        };

        Ok(jsonwebtoken::encode(&Header::default(), &claims, &self.key)?)
    }
}

#[async_trait]
impl NotificationSink for SignalRSink {
    async fn send(&self, target: &str, arguments: Vec<String>) -> Result<(), SinkError> {
        let token = self.access_token()?;
        let message = HubMessage {
            target,
            arguments: &arguments,
        };

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(token)
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(routing_target = target, %status, "notification accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected { status, body })
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde::Deserialize;

    use super::*;

    const ENDPOINT: &str = "https://relay.service.signalr.net";
    const HUB_URL: &str = "https://relay.service.signalr.net/api/v1/hubs/telemetry";

    fn connection(access_key: &str) -> ConnectionString {
        let value = format!("Endpoint={ENDPOINT};AccessKey={access_key};Version=1.0;");
        value.parse().unwrap()
    }

    fn sink(hub: &str) -> SignalRSink {
        SignalRSink::new(
            &connection("abc"),
            hub,
            time::Duration::from_secs(5),
            chrono::Duration::seconds(60),
        )
        .unwrap()
    }

    #[test]
    fn parses_connection_string() {
        let connection = connection("c2VjcmV0a2V5==");

        assert_eq!(
            connection.endpoint.as_str(),
            "https://relay.service.signalr.net/"
        );
        assert_eq!(connection.access_key, "c2VjcmV0a2V5==");
    }

    #[test]
    fn connection_string_keys_are_case_insensitive_and_unordered() {
        let connection: ConnectionString =
            "version=1.0; accesskey=abc ; ENDPOINT=http://localhost;Port=8080"
                .parse()
                .unwrap();

        assert_eq!(connection.endpoint.as_str(), "http://localhost:8080/");
        assert_eq!(connection.access_key, "abc");
    }

    #[test]
    fn connection_string_requires_endpoint_and_key() {
        let invalid = [
            "AccessKey=abc;",
            "Endpoint=https://relay.service.signalr.net;",
            "Endpoint=https://relay.service.signalr.net;AccessKey=;",
            "Endpoint;AccessKey=abc",
            "Endpoint=not a url;AccessKey=abc",
            "Endpoint=https://relay.service.signalr.net;AccessKey=abc;Port=http",
        ];

        for value in invalid {
            assert!(value.parse::<ConnectionString>().is_err(), "{value}");
        }
    }

    #[test]
    fn debug_output_hides_access_key() {
        let connection = connection("supersecret");

        assert!(!format!("{connection:?}").contains("supersecret"));
    }

    #[test]
    fn hub_url_is_lowercased() {
        assert_eq!(sink("Telemetry").url().as_str(), HUB_URL);
    }

    #[derive(Deserialize)]
    struct DecodedClaims {
        aud: String,
        exp: i64,
    }

    #[test]
    fn access_token_is_signed_for_the_hub() {
        let token = sink("telemetry").access_token().unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[HUB_URL]);
        let key = DecodingKey::from_secret(b"abc");
        let decoded = decode::<DecodedClaims>(&token, &key, &validation)
            .expect("token should validate with the access key");

        let now = chrono::Utc::now().timestamp();
        assert_eq!(decoded.claims.aud, HUB_URL);
        assert!(decoded.claims.exp > now);
        assert!(decoded.claims.exp <= now + 60);
    }
}
