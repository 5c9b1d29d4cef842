//! CounselingDesk: the application context held for the process lifetime.
//!
//! Owns the memoized generation and Hub handles, the access gate, the alert mailer and the
//! per-session drafts. Every operation returns a `DeskError` whose `user_message()` is what
//! the form shows inline; nothing is retried.

use crate::config::{HubConfig, StoreBackend};
use crate::draft::{Draft, DraftStore, FormInput};
use crate::gate::{AccessGate, GateError};
use crate::google_auth::ServiceAccountKey;
use crate::hub::{HeaderStatus, Hub, HubError, HubStats, SledHub};
use crate::narrative::{self, GeminiClient, NarrativeDraft, NarrativeError, TextGenerator, TextStream};
use crate::notify::{needs_alert, AlertMessage, AlertNotifier, NotifyError, SmtpAlertMailer};
use crate::prompts::DIAGNOSTIC_PROMPT;
use crate::record::{CounselingRecord, RiskLevel};
use crate::redaction::redact_observation;
use crate::risk::classify_risk;
use crate::sheets::SheetsHub;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DeskError {
    #[error("student id is required")]
    MissingStudentId,
    #[error("observation is required")]
    MissingObservation,
    #[error("nothing generated yet for this session")]
    NoDraft,
    #[error("no pending alert {0}")]
    UnknownAlert(String),
    #[error("text generation unavailable: {0}")]
    GeneratorUnavailable(String),
    #[error("Hub unavailable: {0}")]
    HubUnavailable(String),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Narrative(#[from] NarrativeError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl DeskError {
    /// Inline message for the form.
    pub fn user_message(&self) -> String {
        match self {
            DeskError::MissingStudentId => "⚠️ 請先輸入學生代號再儲存".to_string(),
            DeskError::MissingObservation => "⚠️ 請輸入觀察內容".to_string(),
            DeskError::NoDraft => "⚠️ 請先產生 AI 紀錄再儲存".to_string(),
            DeskError::UnknownAlert(_) => "⚠️ 找不到待發送的通報（可能已送出）".to_string(),
            DeskError::Gate(GateError::WrongPassword) => "❌ 密碼錯誤".to_string(),
            DeskError::Gate(GateError::Unauthorized) => "🔒 請先登入".to_string(),
            DeskError::GeneratorUnavailable(e) | DeskError::HubUnavailable(e) => {
                format!("❌ 系統設定錯誤：{}", e)
            }
            DeskError::Narrative(e) => format!("❌ AI 生成失敗：{}", e),
            DeskError::Hub(e) => format!("❌ 寫入或讀取 Hub 失敗：{}", e),
            DeskError::Notify(e) => format!("❌ 通報信寄送失敗：{}", e),
        }
    }
}

/// What the form shows after generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DraftView {
    pub write_up: String,
    pub actions: Option<String>,
    pub action_error: Option<String>,
    pub generated_text: String,
    pub risk_level: RiskLevel,
    pub risk_fallback: bool,
}

impl From<&Draft> for DraftView {
    fn from(d: &Draft) -> Self {
        Self {
            write_up: d.narrative.write_up.clone(),
            actions: d.narrative.actions.clone(),
            action_error: d.narrative.action_error.clone(),
            generated_text: d.narrative.generated_text(),
            risk_level: d.risk_level,
            risk_fallback: d.risk_fallback,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Overrides the id typed before generation.
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub confidential: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlertStatus {
    NotRequired,
    Pending { alert_id: String },
    Sent,
    Failed { message: String },
    Unconfigured,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub record: CounselingRecord,
    pub alert: AlertStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Check {
    pub ok: bool,
    pub message: String,
}

impl Check {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Environment self-check: configured secret sections, model access, Hub access.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub configured_sections: Vec<String>,
    pub generation: Check,
    pub models: Vec<String>,
    pub probe_reply: Option<String>,
    pub hub: Check,
    pub header: Option<HeaderStatus>,
}

/// A memoized handle, or why it could not be built.
type Handle<T> = Result<T, String>;

pub struct CounselingDesk {
    config: HubConfig,
    generator: Handle<Arc<dyn TextGenerator>>,
    hub: Handle<Hub>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    gate: AccessGate,
    drafts: DraftStore,
}

impl CounselingDesk {
    /// Build every handle from configuration. Handles that fail to build are kept as
    /// errors and reported on use, so the rest of the desk stays usable.
    pub fn from_config(config: HubConfig) -> Self {
        let generator: Handle<Arc<dyn TextGenerator>> = GeminiClient::from_config(&config.gemini)
            .map(|g| Arc::new(g) as Arc<dyn TextGenerator>)
            .map_err(|e| e.to_string());
        if let Err(e) = &generator {
            tracing::warn!("[HUB] generation client not ready: {}", e);
        }

        let hub = build_hub(&config).map_err(|e| e.to_string());
        match &hub {
            Ok(h) => tracing::info!("[HUB] record store: {}", h.describe()),
            Err(e) => tracing::warn!("[HUB] record store not ready: {}", e),
        }

        let notifier = match &config.smtp {
            Some(smtp) => match SmtpAlertMailer::from_config(smtp) {
                Ok(m) => Some(Arc::new(m) as Arc<dyn AlertNotifier>),
                Err(e) => {
                    tracing::warn!("[HUB] alert mail disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let gate = AccessGate::new(config.gate.password.clone());
        Self {
            config,
            generator,
            hub,
            notifier,
            gate,
            drafts: DraftStore::new(),
        }
    }

    /// Assemble from explicit parts (tests, alternative providers).
    pub fn new(
        config: HubConfig,
        generator: Arc<dyn TextGenerator>,
        hub: Hub,
        notifier: Option<Arc<dyn AlertNotifier>>,
    ) -> Self {
        let gate = AccessGate::new(config.gate.password.clone());
        Self {
            config,
            generator: Ok(generator),
            hub: Ok(hub),
            notifier,
            gate,
            drafts: DraftStore::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    fn generator(&self) -> Result<&dyn TextGenerator, DeskError> {
        self.generator
            .as_ref()
            .map(|g| g.as_ref())
            .map_err(|e| DeskError::GeneratorUnavailable(e.clone()))
    }

    fn hub(&self) -> Result<&Hub, DeskError> {
        self.hub
            .as_ref()
            .map_err(|e| DeskError::HubUnavailable(e.clone()))
    }

    pub fn login(&self, password: &str) -> Result<String, DeskError> {
        Ok(self.gate.login(password)?)
    }

    pub fn logout(&self, session: &str) {
        self.gate.logout(session);
        self.drafts.forget_session(session);
    }

    /// Presence checks only; ids are free text.
    pub fn validate_form(form: &FormInput) -> Result<(), DeskError> {
        if form.observation.trim().is_empty() {
            return Err(DeskError::MissingObservation);
        }
        Ok(())
    }

    fn store_draft(&self, session: &str, form: FormInput, narrative: NarrativeDraft) -> DraftView {
        let risk = classify_risk(&narrative.write_up);
        if risk.is_fallback() {
            tracing::warn!(
                student_id = %form.student_id,
                "[HUB] no risk marker in generated text; tagged low by default"
            );
        }
        let draft = Draft {
            form,
            narrative,
            risk_level: risk.level,
            risk_fallback: risk.is_fallback(),
        };
        let view = DraftView::from(&draft);
        self.drafts.put_draft(session, draft);
        view
    }

    /// Write-up plus action/communication draft, kept in the session until saved.
    pub async fn generate(&self, session: &str, form: FormInput) -> Result<DraftView, DeskError> {
        Self::validate_form(&form)?;
        let generator = self.generator()?;
        let narrative =
            narrative::compose(generator, &form.observation, form.target_type, form.category).await?;
        Ok(self.store_draft(session, form, narrative))
    }

    /// Streaming write-up. The caller feeds the collected text to [`Self::finish_stream`].
    pub async fn generate_stream(&self, form: &FormInput) -> Result<TextStream, DeskError> {
        Self::validate_form(form)?;
        let generator = self.generator()?;
        Ok(narrative::rewrite_stream(generator, &form.observation, form.target_type, form.category).await?)
    }

    /// Runs the action/communication call on the streamed write-up, then stores the draft.
    pub async fn finish_stream(
        &self,
        session: &str,
        form: FormInput,
        write_up: String,
    ) -> Result<DraftView, DeskError> {
        if write_up.trim().is_empty() {
            return Err(NarrativeError::EmptyResponse.into());
        }
        let generator = self.generator()?;
        let narrative = narrative::with_actions(generator, write_up, form.target_type, form.category).await;
        Ok(self.store_draft(session, form, narrative))
    }

    /// Append the session's draft as one record. A failed append keeps the draft so the
    /// user can save again; a draft regenerated during the append is kept too.
    pub async fn save(&self, session: &str, req: SaveRequest) -> Result<SaveOutcome, DeskError> {
        let draft = self.drafts.draft(session).ok_or(DeskError::NoDraft)?;
        let student_id = req
            .student_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&draft.form.student_id)
            .trim()
            .to_string();
        if student_id.is_empty() {
            return Err(DeskError::MissingStudentId);
        }
        let hub = self.hub()?;

        let record = CounselingRecord::stamped(
            chrono::Local::now(),
            &student_id,
            draft.form.target_type,
            draft.form.category,
            draft.risk_level,
            redact_observation(draft.form.observation.clone(), req.confidential),
            draft.narrative.generated_text(),
        );
        hub.append_record(&record).await?;
        self.drafts.clear_draft_if(session, &draft);

        let alert = self.dispatch_alert(session, &record).await;
        Ok(SaveOutcome { record, alert })
    }

    async fn dispatch_alert(&self, session: &str, record: &CounselingRecord) -> AlertStatus {
        if !needs_alert(record) {
            return AlertStatus::NotRequired;
        }
        let Some(notifier) = &self.notifier else {
            tracing::warn!(student_id = %record.student_id, "[HUB] high-risk record saved, alert mail not configured");
            return AlertStatus::Unconfigured;
        };
        let message = AlertMessage::for_record(record);
        if self.config.alerts.require_confirmation {
            let alert_id = self.drafts.park_alert(session, record.clone(), message);
            tracing::info!(%alert_id, "[HUB] high-risk alert awaiting confirmation");
            return AlertStatus::Pending { alert_id };
        }
        match notifier.send_alert(&message).await {
            Ok(()) => AlertStatus::Sent,
            Err(e) => {
                tracing::error!("[HUB] alert mail failed: {}", e);
                AlertStatus::Failed {
                    message: DeskError::from(e).user_message(),
                }
            }
        }
    }

    /// Send a parked alert. On failure the alert stays parked for another attempt.
    pub async fn confirm_alert(&self, session: &str, alert_id: &str) -> Result<AlertStatus, DeskError> {
        let notifier = self
            .notifier
            .as_ref()
            .ok_or(DeskError::Notify(NotifyError::Unconfigured))?;
        let pending = self
            .drafts
            .take_alert(session, alert_id)
            .ok_or_else(|| DeskError::UnknownAlert(alert_id.to_string()))?;
        match notifier.send_alert(&pending.message).await {
            Ok(()) => Ok(AlertStatus::Sent),
            Err(e) => {
                tracing::error!(%alert_id, "[HUB] alert mail failed: {}", e);
                let message = DeskError::from(e).user_message();
                self.drafts.restore_alert(alert_id, pending);
                Ok(AlertStatus::Failed { message })
            }
        }
    }

    pub async fn history(&self, student_id: &str) -> Result<Vec<CounselingRecord>, DeskError> {
        if student_id.trim().is_empty() {
            return Err(DeskError::MissingStudentId);
        }
        Ok(self.hub()?.history(student_id).await?)
    }

    pub async fn stats(&self) -> Result<HubStats, DeskError> {
        Ok(self.hub()?.stats().await?)
    }

    /// Never fails: every problem is reported inside the result.
    pub async fn diagnose(&self) -> Diagnostics {
        let configured_sections = self
            .config
            .configured_sections()
            .into_iter()
            .map(String::from)
            .collect();

        let mut models = Vec::new();
        let mut probe_reply = None;
        let generation = match self.generator() {
            Err(e) => Check::failed(e.to_string()),
            Ok(g) => match g.list_models().await {
                Err(e) => Check::failed(format!("model listing failed: {}", e)),
                Ok(list) => {
                    models = list
                        .into_iter()
                        .filter(|m| m.supports_generate_content())
                        .map(|m| m.name)
                        .collect();
                    if models.is_empty() {
                        Check::failed("no model supports generateContent")
                    } else {
                        match g.generate(DIAGNOSTIC_PROMPT).await {
                            Ok(reply) => {
                                probe_reply = Some(reply);
                                Check::ok(format!("{} models available; probe via {} succeeded", models.len(), g.model()))
                            }
                            Err(e) => Check::failed(format!("probe via {} failed: {}", g.model(), e)),
                        }
                    }
                }
            },
        };

        let mut header = None;
        let hub = match self.hub() {
            Err(e) => Check::failed(e.to_string()),
            Ok(h) => match h.header_status().await {
                Ok(status) => {
                    header = Some(status);
                    Check::ok(format!("opened {}", h.describe()))
                }
                Err(e) => Check::failed(e.to_string()),
            },
        };

        Diagnostics {
            configured_sections,
            generation,
            models,
            probe_reply,
            hub,
            header,
        }
    }
}

fn build_hub(config: &HubConfig) -> Result<Hub, HubError> {
    let store = &config.hub;
    match store.backend {
        StoreBackend::Sled => Ok(Hub::new(Arc::new(SledHub::open(&store.sled_path)?))),
        StoreBackend::Sheets => {
            let path = store
                .service_account_path
                .as_deref()
                .ok_or_else(|| HubError::Auth("hub.service_account_path is not set".to_string()))?;
            let key = ServiceAccountKey::from_file(Path::new(path))?;
            let sheets = SheetsHub::new(key, &store.spreadsheet_title, &store.worksheet)?;
            tracing::info!("[HUB] service account {}", sheets.service_account());
            Ok(Hub::new(Arc::new(sheets)))
        }
    }
}
