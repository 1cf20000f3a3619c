use std::{sync::Arc, time::Duration, time::Instant};

use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use tracing::Instrument;

use crate::{
    errors::{Error, Result, TransportError},
    http::{parse_api_error_parts, request_id_from_headers},
    tools::BoxFuture,
    types::{ChatCompletionBody, ChatCompletionResponse, Completion, CompletionRequest},
    DEFAULT_BASE_URL, DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MODEL,
    DEFAULT_REQUEST_TIMEOUT,
};

/// A language model that turns a conversation into raw text.
///
/// Implementations are stateless per call. Network and auth failures should
/// surface as [`Error::UpstreamUnavailable`] and throttling as
/// [`Error::UpstreamRateLimited`]; the reasoning loop retries only those.
pub trait LanguageModel: Send + Sync {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<Completion>>;
}

impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<Completion>> {
        (**self).complete(request)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Model identifier (defaults to `gpt-3.5-turbo`).
    pub model: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout (defaults to 60s).
    pub timeout: Option<Duration>,
}

/// Client for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    endpoint: reqwest::Url,
    api_key: String,
    model: String,
    client_header: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let base = cfg
            .base_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let endpoint = format!("{}/chat/completions", base.trim().trim_end_matches('/'));
        let endpoint = reqwest::Url::parse(&endpoint)
            .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let api_key = cfg
            .api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("api key is required".to_string()))?;
        let model = cfg
            .model
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if model.is_empty() {
            return Err(Error::Config("model is required".to_string()));
        }

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let request_timeout = cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(TransportError::from_reqwest)?,
        };

        let client_header = cfg
            .client_header
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_HEADER.to_string());

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                api_key,
                model,
                client_header,
                http,
                request_timeout,
            }),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Sends one chat-completions request. No retries happen here; the
    /// reasoning loop owns the retry policy.
    pub async fn chat(&self, req: &CompletionRequest) -> Result<Completion> {
        if req.messages.is_empty() {
            return Err(Error::Validation("messages are required".into()));
        }
        self.inner.send(req).await
    }
}

impl LanguageModel for Client {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<Completion>> {
        Box::pin(self.chat(request))
    }
}

impl ClientInner {
    async fn send(&self, req: &CompletionRequest) -> Result<Completion> {
        let span = tracing::debug_span!(
            "nl2sql.llm",
            model = %self.model,
            messages = req.messages.len()
        );
        self.send_inner(req).instrument(span).await
    }

    async fn send_inner(&self, req: &CompletionRequest) -> Result<Completion> {
        let body = ChatCompletionBody::new(&self.model, req);
        let builder = self
            .http
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.client_header)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&body);

        let start = Instant::now();

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                let transport = TransportError::from_reqwest(err);
                tracing::warn!(error = %transport, "transport error");
                return Err(Error::upstream_unavailable(transport.to_string()));
            }
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            tracing::warn!(status = %status, "model request failed");
            let body = resp.text().await.unwrap_or_default();
            return Err(parse_api_error_parts(status, &headers, body));
        }

        let bytes = resp.bytes().await.map_err(|err| {
            Error::upstream_unavailable(TransportError::from_reqwest(err).to_string())
        })?;
        let payload: ChatCompletionResponse =
            serde_json::from_slice(&bytes).map_err(Error::Serialization)?;
        tracing::debug!(
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model request completed"
        );

        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream_unavailable("response contained no choices"))?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: payload.usage,
            model: payload.model,
            finish_reason: choice.finish_reason,
            request_id: request_id_from_headers(&headers),
        })
    }
}
