// ABOUTME: HTTP transport for the control-plane API
// ABOUTME: Follows redirects manually so the bearer token survives every hop, and normalizes error bodies

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::models::decode_resource;
use crate::config::ClientConfig;
use crate::error::{ApiError, Result};

/// Where a request goes: a collection endpoint appended to the base path, or a URL the
/// backend handed us (absolute, or relative to the base URL).
#[derive(Debug, Clone, Copy)]
pub enum RequestTarget<'a> {
    Endpoint(&'a str),
    Url(&'a str),
}

/// One logical response, after redirects and the trailing-slash retry have been resolved.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self, what: &'static str) -> Result<T> {
        decode_resource(&self.body, what)
    }
}

#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    config: Arc<ClientConfig>,
    base: Url,
    cancel: CancellationToken,
}

impl RemoteClient {
    pub fn new(config: Arc<ClientConfig>) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| ApiError::InvalidUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;

        // The default policy drops Authorization on cross-origin hops; redirects are
        // resolved in `execute` instead.
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            config,
            base,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort every in-flight call and wait loop on this client when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn resolve(&self, target: RequestTarget<'_>, query: &[(&str, String)]) -> Result<Url> {
        let mut url = match target {
            RequestTarget::Endpoint(ep) => {
                let mut url = self.base.clone();
                let path = format!("{}{}", self.base.path().trim_end_matches('/'), ep);
                url.set_path(&path);
                url
            }
            RequestTarget::Url(raw) => self.base.join(raw).map_err(|e| ApiError::InvalidUrl {
                url: raw.to_string(),
                reason: e.to_string(),
            })?,
        };
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Issue one logical request.
    ///
    /// 3xx responses are followed up to the configured cap, re-attaching credentials on every
    /// hop; a 303 downgrades to a bodiless GET. A POST answered with 404/405 on a URL without
    /// a trailing slash is retried once with the slash appended. Any final status >= 400 is
    /// returned as [`ApiError::Http`].
    pub async fn execute<P: Serialize + ?Sized>(
        &self,
        method: Method,
        target: RequestTarget<'_>,
        query: &[(&str, String)],
        payload: Option<&P>,
    ) -> Result<ResponseEnvelope> {
        let body = payload
            .map(serde_json::to_vec)
            .transpose()
            .map_err(ApiError::Serialize)?;
        let url = self.resolve(target, query)?;
        self.guard(self.follow(method, url, body)).await
    }

    async fn follow(
        &self,
        mut method: Method,
        mut url: Url,
        mut body: Option<Vec<u8>>,
    ) -> Result<ResponseEnvelope> {
        let limit = self.config.max_redirects();
        let mut hops = 0usize;
        let mut slash_retried = false;

        loop {
            let response = self.send_once(&method, &url, body.as_deref()).await?;
            let status = response.status();

            if status.is_redirection() {
                if hops >= limit {
                    return Err(ApiError::TooManyRedirects {
                        url: url.to_string(),
                        limit,
                    });
                }
                hops += 1;

                let location = response
                    .headers()
                    .get(LOCATION)
                    .ok_or_else(|| ApiError::MissingLocation {
                        url: url.to_string(),
                    })?;
                let location = location.to_str().map_err(|_| ApiError::InvalidLocation {
                    url: url.to_string(),
                    location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
                })?;
                let next = url.join(location).map_err(|_| ApiError::InvalidLocation {
                    url: url.to_string(),
                    location: location.to_string(),
                })?;

                if status == StatusCode::SEE_OTHER {
                    method = Method::GET;
                    body = None;
                }
                debug!(status = status.as_u16(), from = %url, to = %next, "Following redirect");
                url = next;
                continue;
            }

            if method == Method::POST
                && matches!(status, StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED)
                && !slash_retried
                && !url.path().ends_with('/')
            {
                slash_retried = true;
                let path = format!("{}/", url.path());
                url.set_path(&path);
                debug!(status = status.as_u16(), url = %url, "Retrying POST with trailing slash");
                continue;
            }

            let headers = response.headers().clone();
            let bytes = response.bytes().await?.to_vec();

            if status.as_u16() >= 400 {
                return Err(decode_error(status, &bytes));
            }

            return Ok(ResponseEnvelope {
                status,
                headers,
                body: bytes,
            });
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response> {
        debug!(method = %method, url = %url, "HTTP request");

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(ACCEPT, "application/json");
        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        }
        if let Some(bytes) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.to_vec());
        }

        let response = request.send().await?;
        debug!(status = response.status().as_u16(), url = %url, "HTTP response");
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ep: &str,
        query: &[(&str, String)],
        what: &'static str,
    ) -> Result<T> {
        self.execute::<()>(Method::GET, RequestTarget::Endpoint(ep), query, None)
            .await?
            .json(what)
    }

    pub async fn post<P: Serialize + ?Sized>(
        &self,
        ep: &str,
        payload: &P,
    ) -> Result<ResponseEnvelope> {
        self.execute(Method::POST, RequestTarget::Endpoint(ep), &[], Some(payload))
            .await
    }

    pub async fn post_json<P: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        ep: &str,
        payload: &P,
        what: &'static str,
    ) -> Result<T> {
        self.post(ep, payload).await?.json(what)
    }

    pub async fn delete(&self, ep: &str) -> Result<ResponseEnvelope> {
        self.execute::<()>(Method::DELETE, RequestTarget::Endpoint(ep), &[], None)
            .await
    }

    /// Race `fut` against this client's cancellation token.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            res = fut => res,
        }
    }

    /// Cancellable sleep used between polls.
    pub(crate) async fn pause(&self, duration: Duration) -> Result<()> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// Build the error for a final status >= 400, preferring a structured `{code, message}` or
/// `{message, error}` body and falling back to the raw text.
pub fn decode_error(status: StatusCode, body: &[u8]) -> ApiError {
    let (code, message) = structured_error(body);
    let message = message.unwrap_or_else(|| {
        let raw = String::from_utf8_lossy(body).trim().to_string();
        if raw.is_empty() {
            status.canonical_reason().unwrap_or("").to_string()
        } else {
            raw
        }
    });
    ApiError::Http {
        status: status.as_u16(),
        code,
        message,
    }
}

fn structured_error(body: &[u8]) -> (Option<String>, Option<String>) {
    use serde_json::Value;

    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
        return (None, None);
    };
    let text = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let nested = map.get("error").and_then(Value::as_object);

    let code = text(map.get("code")).or_else(|| nested.and_then(|n| text(n.get("code"))));
    let message = text(map.get("message"))
        .or_else(|| text(map.get("error")))
        .or_else(|| nested.and_then(|n| text(n.get("message"))));
    (code, message)
}
