//! HTTP Client für das Call-Signaling
//!
//! Spricht die `/calls/*` Endpunkte des Backends:
//! - Form-encoded `POST /calls/start`
//! - JSON Bodies für Offer, Answer und ICE Candidates
//! - Bearer-Token aus dem Auth-Modul auf jedem Request
//! - Status-Polling statt Push, damit spät angemeldete Peers nichts verpassen

use super::messages::*;
use super::transport::SignalingTransport;
use crate::config::CallConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Server error: {status} - {body}")]
    ServerError { status: u16, body: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SignalingError {
    /// Netzwerkfehler und 5xx lohnen einen erneuten Versuch beim nächsten Tick
    pub fn is_transient(&self) -> bool {
        match self {
            SignalingError::RequestFailed(_) => true,
            SignalingError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SignalingError {
    fn from(e: reqwest::Error) -> Self {
        SignalingError::RequestFailed(e.to_string())
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    auth_token: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// HTTP Client für Signaling-Server Kommunikation
pub struct HttpSignalingClient {
    base_url: Url,
    http: reqwest::Client,
    state: Arc<RwLock<ClientState>>,
}

impl HttpSignalingClient {
    /// Erstellt einen neuen Client für die angegebene API-Basis (z.B. `https://host/api`)
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, SignalingError> {
        // Ohne abschließenden Slash würde `join` das letzte Segment ersetzen
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };

        let base_url =
            Url::parse(&normalized).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            http,
            state: Arc::new(RwLock::new(ClientState::default())),
        })
    }

    /// Erstellt den Client aus der Konfiguration inklusive Token
    pub fn from_config(config: &CallConfig) -> Result<Self, SignalingError> {
        let client = Self::new(&config.api_base_url, config.request_timeout)?;
        if let Some(token) = &config.auth_token {
            client.set_auth_token(token.clone());
        }
        Ok(client)
    }

    /// Setzt das Bearer-Token (vom Auth-Modul geliefert)
    pub fn set_auth_token(&self, token: String) {
        self.state.write().auth_token = Some(token);
    }

    pub fn clear_auth_token(&self) {
        self.state.write().auth_token = None;
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn endpoint(&self, path: &str) -> Result<Url, SignalingError> {
        self.base_url
            .join(path)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SignalingError> {
        let token = self
            .state
            .read()
            .auth_token
            .clone()
            .ok_or(SignalingError::NotAuthenticated)?;

        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .bearer_auth(token))
    }

    /// Schickt den Request ab und wandelt Nicht-2xx Antworten in Fehler um
    async fn execute(builder: RequestBuilder) -> Result<Response, SignalingError> {
        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SignalingError::ServerError {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn call_path(call_id: &str, action: &str) -> String {
        format!("calls/{}/{}", urlencode_segment(call_id), action)
    }
}

#[async_trait]
impl SignalingTransport for HttpSignalingClient {
    async fn create_call(
        &self,
        conversation_id: &str,
        call_type: CallType,
    ) -> Result<String, SignalingError> {
        tracing::info!("Creating {} call in conversation {}", call_type, conversation_id);

        let builder = self.request(Method::POST, "calls/start")?.form(&[
            ("conversation_id", conversation_id),
            ("call_type", call_type.as_str()),
        ]);

        let response: StartCallResponse = Self::execute(builder)
            .await?
            .json()
            .await
            .map_err(|e| SignalingError::InvalidPayload(e.to_string()))?;

        if response.call_id.trim().is_empty() {
            return Err(SignalingError::InvalidPayload("empty call_id".to_string()));
        }

        Ok(response.call_id)
    }

    async fn send_signal(
        &self,
        call_id: &str,
        payload: &SignalPayload,
    ) -> Result<(), SignalingError> {
        let builder = match payload {
            SignalPayload::Offer { .. } => self
                .request(Method::POST, &Self::call_path(call_id, "signal"))?
                .json(payload),
            SignalPayload::Answer { .. } => self
                .request(Method::POST, &Self::call_path(call_id, "answer"))?
                .json(payload),
            SignalPayload::IceCandidate(candidate) => {
                return self.send_ice_candidate(call_id, candidate).await;
            }
        };

        Self::execute(builder).await?;
        Ok(())
    }

    async fn poll_status(&self, call_id: &str) -> Result<CallStatusUpdate, SignalingError> {
        let builder = self.request(Method::GET, &Self::call_path(call_id, "status"))?;

        let raw: RawCallStatus = Self::execute(builder)
            .await?
            .json()
            .await
            .map_err(|e| SignalingError::InvalidPayload(e.to_string()))?;

        Ok(CallStatusUpdate::from(raw))
    }

    async fn send_ice_candidate(
        &self,
        call_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let builder = self
            .request(Method::POST, &Self::call_path(call_id, "ice"))?
            .json(&IceCandidateBody { candidate });

        Self::execute(builder).await?;
        Ok(())
    }

    async fn reject(&self, call_id: &str) -> Result<(), SignalingError> {
        let builder = self.request(Method::POST, &Self::call_path(call_id, "reject"))?;
        Self::execute(builder).await?;
        Ok(())
    }

    async fn end(&self, call_id: &str) -> Result<(), SignalingError> {
        let builder = self.request(Method::POST, &Self::call_path(call_id, "end"))?;
        Self::execute(builder).await?;
        Ok(())
    }

    async fn pending_call(
        &self,
        conversation_id: &str,
    ) -> Result<Option<PendingCall>, SignalingError> {
        let path = format!("calls/pending/{}", urlencode_segment(conversation_id));
        let builder = self.request(Method::GET, &path)?;

        let body = Self::execute(builder).await?.text().await?;
        parse_pending_call(&body)
    }
}

/// "call object or empty": leerer Body, `null`, `{}` und `{"call": null}` heißen kein Anruf
fn parse_pending_call(body: &str) -> Result<Option<PendingCall>, SignalingError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }

    let mut value: Value =
        serde_json::from_str(body).map_err(|e| SignalingError::InvalidPayload(e.to_string()))?;

    if let Some(inner) = value.get_mut("call") {
        value = inner.take();
    }

    match &value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SignalingError::InvalidPayload(e.to_string())),
    }
}

/// IDs landen als einzelnes Pfadsegment in der URL
fn urlencode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

impl std::fmt::Debug for HttpSignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignalingClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.state.read().auth_token.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
