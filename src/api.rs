//! REST client for the interview server
//!
//! Covers session creation, status, artifacts and remote teardown. Audio negotiation
//! lives in `rtc::signaling`; both resolve paths with [`join_path`].

use crate::config::Config;
use crate::error::ApiError;
use crate::session::{SessionDescriptor, Speaker};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Join a server-relative path onto the base URL, keeping any base path prefix
pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}

/// `GET /api/sessions/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
    pub ended_at: Option<String>,
    pub asset_count: usize,
    pub transcript_count: usize,
}

/// `GET /api/webrtc/status/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionInfo {
    pub is_active: bool,
}

/// One finalized turn of the server-side transcript
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub ts: String,
}

/// `GET /api/sessions/{id}/artifacts/transcript`
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptArtifact {
    #[serde(default)]
    pub turns: Vec<TranscriptTurn>,
}

/// Outcome of ending a session on the server
#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    Ended { summary: Option<serde_json::Value> },
    AlreadyEnded,
}

#[derive(Debug, Deserialize)]
struct EndResponse {
    #[serde(default)]
    summary: Option<serde_json::Value>,
}

/// Client for the interview server's REST API
pub struct ApiClient {
    client: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let base = Url::parse(&config.server.base_url)
            .map_err(|e| ApiError::InvalidResponse(format!("invalid base URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, base })
    }

    /// Base that relative asset locations and negotiation paths resolve against
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        join_path(&self.base, path).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Create a session from a prompt, one or more asset files and an optional knowledge base
    #[instrument(skip(self, prompt), fields(assets = assets.len()))]
    pub async fn create_session(
        &self,
        prompt: &str,
        assets: &[PathBuf],
        knowledge_base: Option<&Path>,
    ) -> Result<SessionDescriptor, ApiError> {
        let mut form = Form::new().text("prompt", prompt.to_string());
        for path in assets {
            form = form.part("assets", file_part(path).await?);
        }
        if let Some(path) = knowledge_base {
            form = form.part("kb", file_part(path).await?);
        }

        let response = self
            .client
            .post(self.url("/api/sessions")?)
            .multipart(form)
            .send()
            .await?;
        let descriptor: SessionDescriptor = parse_json(check(response, "new session").await?).await?;
        info!(
            session_id = %descriptor.session_id,
            assets = descriptor.asset_manifest.len(),
            "Session created"
        );
        Ok(descriptor)
    }

    /// Fetch session details.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] when the server does not know `session_id`,
    /// [`ApiError::Server`] for any other non-success response.
    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, ApiError> {
        let url = self.url(&format!("/api/sessions/{}", session_id))?;
        let response = self.client.get(url).send().await?;
        parse_json(check(response, session_id).await?).await
    }

    /// Whether the server still holds an audio connection for the session
    pub async fn connection_status(&self, session_id: &str) -> Result<ConnectionInfo, ApiError> {
        let url = self.url(&format!("/api/webrtc/status/{}", session_id))?;
        let response = self.client.get(url).send().await?;
        parse_json(check(response, session_id).await?).await
    }

    /// Finalized turns as recorded by the server
    pub async fn transcript(&self, session_id: &str) -> Result<TranscriptArtifact, ApiError> {
        let url = self.url(&format!("/api/sessions/{}/artifacts/transcript", session_id))?;
        let response = self.client.get(url).send().await?;
        parse_json(check(response, session_id).await?).await
    }

    /// Server rendering of the transcript as plain text.
    ///
    /// # Returns
    ///
    /// The response body unchanged.
    pub async fn transcript_text(&self, session_id: &str) -> Result<String, ApiError> {
        let url = self.url(&format!(
            "/api/sessions/{}/artifacts/transcript.txt",
            session_id
        ))?;
        let response = self.client.get(url).send().await?;
        Ok(check(response, session_id).await?.text().await?)
    }

    /// Session summary. Its shape is owned by the server so it stays untyped.
    pub async fn summary(&self, session_id: &str) -> Result<serde_json::Value, ApiError> {
        let url = self.url(&format!("/api/sessions/{}/artifacts/json", session_id))?;
        let response = self.client.get(url).send().await?;
        parse_json(check(response, session_id).await?).await
    }

    /// Stop the server-side pipeline, then mark the session ended.
    /// A session the server no longer knows about counts as already ended.
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: &str) -> Result<EndOutcome, ApiError> {
        let url = self.url(&format!("/api/webrtc/end/{}", session_id))?;
        let response = self.client.post(url).send().await?;
        check(response, session_id).await?;
        debug!("Remote pipeline stopped");

        let url = self.url(&format!("/api/sessions/{}/end", session_id))?;
        let response = self.client.post(url).send().await?;
        match check(response, session_id).await {
            Ok(response) => {
                let body: EndResponse = parse_json(response).await?;
                info!("Session ended on server");
                Ok(EndOutcome::Ended {
                    summary: body.summary,
                })
            }
            Err(ApiError::NotFound(_)) => {
                warn!("Session already ended on server");
                Ok(EndOutcome::AlreadyEnded)
            }
            Err(e) => Err(e),
        }
    }
}

async fn file_part(path: &Path) -> Result<Part, ApiError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ApiError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

async fn check(response: Response, what: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(what.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_http {
    //! Scripted HTTP server for client tests
    use axum::extract::State;
    use axum::http::{header, Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::Router;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use url::Url;

    /// A request as seen by the server
    #[derive(Debug, Clone)]
    pub(crate) struct Seen {
        pub method: Method,
        pub path: String,
        pub body: String,
    }

    #[derive(Clone)]
    struct Script {
        responses: Arc<Mutex<VecDeque<(u16, &'static str)>>>,
        seen_tx: mpsc::UnboundedSender<Seen>,
    }

    /// Answer successive requests with `responses` in order, reporting each request
    pub(crate) async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (Url, mpsc::UnboundedReceiver<Seen>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let script = Script {
            responses: Arc::new(Mutex::new(responses.into())),
            seen_tx,
        };
        let app = Router::new().fallback(respond).with_state(script);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{}/", addr)).unwrap(), seen_rx)
    }

    async fn respond(
        State(script): State<Script>,
        method: Method,
        uri: Uri,
        body: String,
    ) -> impl IntoResponse {
        let _ = script.seen_tx.send(Seen {
            method,
            path: uri.path().to_string(),
            body,
        });
        let (status, body) = script
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((500, "no scripted response left"));
        (
            StatusCode::from_u16(status).unwrap(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
    }
}
