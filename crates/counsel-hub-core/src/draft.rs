//! Session-scoped work in progress: the generated draft awaiting save, and high-risk
//! alerts awaiting explicit confirmation.

use crate::narrative::NarrativeDraft;
use crate::notify::AlertMessage;
use crate::record::{Category, CounselingRecord, RiskLevel, TargetType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// The five form fields. `confidential` is read at save time, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormInput {
    pub target_type: TargetType,
    #[serde(default)]
    pub student_id: String,
    pub category: Category,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub form: FormInput,
    pub narrative: NarrativeDraft,
    pub risk_level: RiskLevel,
    /// True when no risk marker was found and `Low` is the fallback.
    pub risk_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub session: String,
    pub record: CounselingRecord,
    pub message: AlertMessage,
}

#[derive(Default)]
pub struct DraftStore {
    drafts: DashMap<String, Draft>,
    alerts: DashMap<String, PendingAlert>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier draft for the session.
    pub fn put_draft(&self, session: &str, draft: Draft) {
        self.drafts.insert(session.to_string(), draft);
    }

    pub fn draft(&self, session: &str) -> Option<Draft> {
        self.drafts.get(session).map(|d| d.clone())
    }

    pub fn clear_draft(&self, session: &str) {
        self.drafts.remove(session);
    }

    /// Remove the session's draft only if it is still `saved`; a newer draft survives.
    pub fn clear_draft_if(&self, session: &str, saved: &Draft) -> bool {
        self.drafts.remove_if(session, |_, d| d == saved).is_some()
    }

    /// Park an alert; returns its id.
    pub fn park_alert(&self, session: &str, record: CounselingRecord, message: AlertMessage) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.alerts.insert(
            id.clone(),
            PendingAlert {
                session: session.to_string(),
                record,
                message,
            },
        );
        id
    }

    /// Remove a pending alert owned by `session`.
    pub fn take_alert(&self, session: &str, id: &str) -> Option<PendingAlert> {
        self.alerts
            .remove_if(id, |_, a| a.session == session)
            .map(|(_, a)| a)
    }

    pub fn restore_alert(&self, id: &str, alert: PendingAlert) {
        self.alerts.insert(id.to_string(), alert);
    }

    pub fn pending_alerts(&self, session: &str) -> Vec<(String, PendingAlert)> {
        self.alerts
            .iter()
            .filter(|e| e.value().session == session)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drop everything a session holds. Pending alerts go with it.
    pub fn forget_session(&self, session: &str) {
        self.drafts.remove(session);
        self.alerts.retain(|_, a| a.session != session);
    }
}
