//! Upstream market-data provider interface
//!
//! The session manager only talks to [`MarketDataProvider`] and [`UpstreamStream`],
//! so tests substitute scripted providers without touching the session logic.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::protocol::ControlFrame;
use crate::config::UpstreamConfig;
use crate::domain::{Session, SessionGrant};
use crate::error::{QuoteflowError, Result};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// REST call returning a bearer token for the stream
    async fn create_session(&self) -> Result<SessionGrant>;

    /// Extend an existing session before it expires
    async fn refresh_session(&self, session: &Session) -> Result<SessionGrant>;

    /// Open the streaming connection authenticated with `session`
    async fn open_stream(&self, session: &Session) -> Result<Box<dyn UpstreamStream>>;
}

/// One live upstream connection
#[async_trait]
pub trait UpstreamStream: Send {
    async fn send(&mut self, frame: &ControlFrame) -> Result<()>;

    /// Next text message. `None` once the connection has closed.
    ///
    /// Must be cancel-safe: the read loop drops it when other branches fire.
    async fn next_message(&mut self) -> Option<Result<String>>;

    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self);
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// REST + WebSocket provider
pub struct WsProvider {
    http: reqwest::Client,
    rest_url: String,
    ws_url: Url,
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl WsProvider {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(connect_timeout)
            .build()?;
        let ws_url = Url::parse(&config.ws_url)
            .map_err(|e| QuoteflowError::InvalidConfig(format!("invalid upstream.ws_url: {}", e)))?;

        Ok(Self {
            http,
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            ws_url,
            api_key: config.api_key.clone(),
            connect_timeout,
        })
    }

    async fn post_session(&self, path: &str, bearer: Option<&str>) -> Result<SessionGrant> {
        let url = format!("{}{}", self.rest_url, path);
        let mut request = self.http.post(&url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                QuoteflowError::TransientUpstream(format!("session request failed: {}", e))
            } else {
                QuoteflowError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: SessionResponse = response.json().await?;
        Ok(SessionGrant {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> QuoteflowError {
    let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => QuoteflowError::Authentication(detail),
        StatusCode::TOO_MANY_REQUESTS => QuoteflowError::RateLimited(detail),
        _ => QuoteflowError::TransientUpstream(detail),
    }
}

#[async_trait]
impl MarketDataProvider for WsProvider {
    async fn create_session(&self) -> Result<SessionGrant> {
        debug!("Creating upstream session");
        self.post_session("/v1/session", self.api_key.as_deref()).await
    }

    async fn refresh_session(&self, session: &Session) -> Result<SessionGrant> {
        debug!("Refreshing upstream session");
        self.post_session("/v1/session/refresh", Some(&session.token))
            .await
    }

    async fn open_stream(&self, session: &Session) -> Result<Box<dyn UpstreamStream>> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(&format!("Bearer {}", session.token))
            .map_err(|e| QuoteflowError::Authentication(format!("unusable session token: {}", e)))?;
        request.headers_mut().insert("Authorization", header);

        info!("Connecting to upstream stream: {}", self.ws_url);
        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| {
            QuoteflowError::TransientUpstream(format!(
                "stream connect timed out after {:?}",
                self.connect_timeout
            ))
        })??;

        Ok(Box::new(WsStream { inner: ws }))
    }
}

struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UpstreamStream for WsStream {
    async fn send(&mut self, frame: &ControlFrame) -> Result<()> {
        self.inner.send(Message::Text(frame.encode()?)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        return Some(Err(QuoteflowError::ProtocolParse(
                            "non-UTF-8 binary frame".into(),
                        )))
                    }
                },
                // tungstenite queues the pong and writes it on the next read or send,
                // so nothing here awaits a write
                Ok(Message::Ping(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!("Upstream sent close frame: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
