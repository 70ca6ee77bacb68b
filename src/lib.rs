//! EncrypTalk Call - Anruf-Signaling und Session-Verhandlung
//!
//! Kern der 1:1 Audio/Video-Anrufe des EncrypTalk Messengers:
//! - Backend `/calls/*` als Pull-basierter Signaling-Kanal
//! - WebRTC für die eigentliche Medienverbindung
//! - Ein Controller pro Client, genau eine aktive Session

pub mod call_engine;
pub mod config;
pub mod signaling;

pub use call_engine::{CallEngine, CallEngineError, CallEvent, CallSession, CallState};
pub use config::{CallConfig, ConfigError};
pub use signaling::{CallType, HttpSignalingClient, SignalingError, SignalingTransport};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "encryptalk_call=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang vor dem Default-Filter. Ein bereits installierter
/// Subscriber bleibt bestehen.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized");
    }
}
