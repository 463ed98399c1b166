//! reqwest-backed transport

use super::{CredentialsPolicy, Method, RawResponse, RequestOptions, Transport, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Instant;

/// Transport that talks HTTP through reqwest.
///
/// Timeouts are owned by the executor, so neither client sets one.
pub struct HttpTransport {
    /// Client with a cookie store, used unless credentials are omitted
    client: Client,
    /// Cookie-less client for `CredentialsPolicy::Omit`
    anonymous: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: Client::builder().cookie_store(true).build()?,
            anonymous: Client::builder().build()?,
        })
    }

    fn client_for(&self, credentials: CredentialsPolicy) -> &Client {
        match credentials {
            CredentialsPolicy::Omit => &self.anonymous,
            CredentialsPolicy::SameOrigin | CredentialsPolicy::Include => &self.client,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<RawResponse, TransportError> {
        let client = self.client_for(options.credentials);

        let mut request = match options.method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
        };
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}
