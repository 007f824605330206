use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::delivery::client::{EndpointClient, EndpointRequest, EndpointStatus, IDEMPOTENCY_KEY_HEADER};
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;

/// [`EndpointClient`] posting JSON payloads over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEndpointClient {
    client: Client,
}

impl HttpEndpointClient {
    pub fn new() -> FlowResult<Self> {
        let client = Client::builder().build()?;

        Ok(Self { client })
    }

    fn headers(request: &EndpointRequest) -> FlowResult<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                flow_error!(
                    ErrorKind::ConfigError,
                    "Invalid delivery header name",
                    format!("header `{name}`"),
                    source: err
                )
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                flow_error!(
                    ErrorKind::ConfigError,
                    "Invalid delivery header value",
                    format!("header `{name}`"),
                    source: err
                )
            })?;
            headers.insert(name, value);
        }

        let key = HeaderValue::from_str(request.idempotency_key.as_str()).map_err(|err| {
            flow_error!(
                ErrorKind::InvalidData,
                "Idempotency key is not a valid header value",
                request.idempotency_key,
                source: err
            )
        })?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, key);

        Ok(headers)
    }
}

impl EndpointClient for HttpEndpointClient {
    async fn send(&self, request: &EndpointRequest) -> FlowResult<EndpointStatus> {
        let response = self
            .client
            .post(&request.url)
            .headers(Self::headers(request)?)
            .timeout(request.timeout)
            .json(&request.payload)
            .send()
            .await?;

        Ok(EndpointStatus(response.status().as_u16()))
    }
}
