//! Counseling Hub core library.
//! Record schema, narrative transform, Hub adapters, access gate and high-risk alerts.

pub mod config;
pub mod desk;
pub mod draft;
pub mod gate;
pub mod google_auth;
pub mod hub;
pub mod narrative;
pub mod notify;
pub mod prompts;
pub mod record;
pub mod redaction;
pub mod risk;
pub mod sheets;

pub use config::HubConfig;
pub use desk::{AlertStatus, CounselingDesk, DeskError, Diagnostics, DraftView, SaveOutcome, SaveRequest};
pub use draft::FormInput;
pub use gate::{AccessGate, GateError};
pub use hub::{Hub, HubError, HubStats, RecordStore, SledHub};
pub use narrative::{GeminiClient, ModelInfo, NarrativeError, TextGenerator, TextStream};
pub use notify::{AlertMessage, AlertNotifier, NotifyError};
pub use record::{Category, CounselingRecord, RiskLevel, TargetType};
pub use risk::classify_risk;
pub use sheets::SheetsHub;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
