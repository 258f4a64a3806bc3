//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, UploadBody},
};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    multipart::{Form, Part},
    Body, Client,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Reqwest-based HTTP client implementation
///
/// Provides streamed uploads with:
/// - Connection pooling via reqwest
/// - TLS support by default
/// - Multipart or raw request bodies
///
/// Overall request deadlines come from [`HttpRequest::timeout`]; the client
/// only bounds connection setup.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connection timeout
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .user_agent(concat!("hold/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Convert bridge HttpMethod to reqwest Method
    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Post => reqwest::Method::POST,
        }
    }

    /// The endpoint URL may carry credentials, so it is left out of the message
    fn map_error(e: reqwest::Error) -> BridgeError {
        let e = e.without_url();
        if e.is_timeout() {
            BridgeError::Timeout(e.to_string())
        } else if e.is_connect() {
            BridgeError::Network(format!("Connection failed: {}", e))
        } else {
            BridgeError::Network(e.to_string())
        }
    }

    /// Build reqwest request from bridge request and streamed body
    fn build_request(
        &self,
        request: HttpRequest,
        body: UploadBody,
    ) -> Result<reqwest::RequestBuilder> {
        let method = Self::convert_method(request.method);
        let mut req = self.client.request(method, &request.url);

        for (key, value) in request.headers {
            req = req.header(key, value);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        let UploadBody {
            stream,
            file_name,
            mime_type,
            content_length,
            form_field,
        } = body;
        let stream_body = Body::wrap_stream(stream);

        let req = match form_field {
            Some(field) => {
                let part = match content_length {
                    Some(length) => Part::stream_with_length(stream_body, length),
                    None => Part::stream(stream_body),
                };
                let part = part.file_name(file_name).mime_str(&mime_type).map_err(|e| {
                    BridgeError::OperationFailed(format!("invalid mime type {}: {}", mime_type, e))
                })?;
                req.multipart(Form::new().part(field, part))
            }
            None => {
                req = req.header(CONTENT_TYPE, mime_type);
                if let Some(length) = content_length {
                    req = req.header(CONTENT_LENGTH, length);
                }
                req.body(stream_body)
            }
        };

        Ok(req)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send_stream(&self, request: HttpRequest, body: UploadBody) -> Result<HttpResponse> {
        debug!(
            url = %loggable_url(&request.url),
            file_name = %body.file_name,
            content_length = ?body.content_length,
            "Sending streamed request"
        );

        let response = self
            .build_request(request, body)?
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "HTTP request failed");
                Self::map_error(e)
            })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let body = response.bytes().await.map_err(Self::map_error)?;

        debug!(status = status, "Received response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Endpoint URL without userinfo, query or fragment
fn loggable_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return "[invalid url]".to_string();
    };
    parsed.set_username("").ok();
    parsed.set_password(None).ok();
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.into()
}
