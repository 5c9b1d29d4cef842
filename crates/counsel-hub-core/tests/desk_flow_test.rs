//! Integration test: CounselingDesk end to end over a local Hub.
//!
//! Verifies that:
//! 1. Every save appends exactly one row, in order, with the canonical schema.
//! 2. Confidential saves never persist the raw observation.
//! 3. History returns exactly the records for one student id.
//! 4. High-risk saves park an alert until confirmed; failed sends stay parked.
//! 5. A failed append keeps the draft so the user can save again.
//! 6. Streamed and one-shot drafts both carry the action/communication section, and a
//!    failed action call keeps the write-up savable.

use async_trait::async_trait;
use futures_util::StreamExt;
use counsel_hub_core::{
    hub::HubError, narrative::NarrativeError, record::canonical_header, redaction::REDACTED_PLACEHOLDER,
    AlertMessage, AlertNotifier, AlertStatus, Category, CounselingDesk, DeskError, FormInput, Hub, HubConfig,
    ModelInfo, NotifyError, RecordStore, RiskLevel, SaveRequest, SledHub, TargetType, TextGenerator,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Replies depend on the observation text so one generator can serve several scenarios.
struct KeywordGenerator;

#[async_trait]
impl TextGenerator for KeywordGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError> {
        let level = if prompt.contains("輕生") {
            "高"
        } else if prompt.contains("衝突") || prompt.contains("推擠") {
            "中"
        } else {
            "低"
        };
        Ok(format!("風險等級：{}\n個案描述：依觀察內容整理。", level))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, NarrativeError> {
        Ok(Vec::new())
    }

    fn model(&self) -> &str {
        "keyword"
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<AlertMessage>>,
    fail: AtomicBool,
}

#[async_trait]
impl AlertNotifier for Outbox {
    async fn send_alert(&self, alert: &AlertMessage) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Address("relay down".into()));
        }
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Wraps a store and fails appends while `fail` is set.
struct FlakyStore {
    inner: SledHub,
    fail: AtomicBool,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn read_header(&self) -> Result<Vec<String>, HubError> {
        self.inner.read_header().await
    }

    async fn write_header(&self, header: &[String]) -> Result<(), HubError> {
        self.inner.write_header(header).await
    }

    async fn append(&self, row: Vec<String>) -> Result<(), HubError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HubError::Permission("read-only share".into()));
        }
        self.inner.append(row).await
    }

    async fn scan_all(&self) -> Result<Vec<Vec<String>>, HubError> {
        self.inner.scan_all().await
    }

    fn describe(&self) -> String {
        "flaky".into()
    }
}

fn desk_with(store: Arc<dyn RecordStore>, outbox: Option<Arc<Outbox>>) -> CounselingDesk {
    CounselingDesk::new(
        HubConfig::default(),
        Arc::new(KeywordGenerator),
        Hub::new(store),
        outbox.map(|o| o as Arc<dyn AlertNotifier>),
    )
}

fn form(student_id: &str, category: Category, observation: &str) -> FormInput {
    FormInput {
        target_type: TargetType::Student,
        student_id: student_id.into(),
        category,
        observation: observation.into(),
    }
}

#[tokio::test]
async fn saves_append_one_row_each_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledHub::open(dir.path().join("hub")).unwrap());
    let desk = desk_with(store.clone(), None);

    for i in 0..5 {
        desk.generate("s", form(&format!("S{}", i), Category::AcademicStress, "成績下滑"))
            .await
            .unwrap();
        desk.save("s", SaveRequest::default()).await.unwrap();
    }

    assert_eq!(store.read_header().await.unwrap(), canonical_header());
    let rows = store.scan_all().await.unwrap();
    assert_eq!(rows.len(), 5);
    let ids: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
    assert_eq!(ids, ["S0", "S1", "S2", "S3", "S4"]);
    assert!(rows.iter().all(|r| r.len() == canonical_header().len()));
}

#[tokio::test]
async fn recess_conflict_is_recorded_as_medium() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    let view = desk
        .generate(
            "s",
            form("S1024", Category::InterpersonalConflict, "下課時與同學在走廊推擠，事後情緒低落。"),
        )
        .await
        .unwrap();
    assert_eq!(view.risk_level, RiskLevel::Medium);
    assert!(!view.risk_fallback);
    assert!(!view.generated_text.trim().is_empty());

    let outcome = desk.save("s", SaveRequest::default()).await.unwrap();
    assert_eq!(outcome.alert, AlertStatus::NotRequired);
    assert_eq!(outcome.record.category, Category::InterpersonalConflict);
    assert_eq!(outcome.record.raw_observation, "下課時與同學在走廊推擠，事後情緒低落。");
    assert!(outcome.record.generated_text.starts_with("風險等級：中"));
}

#[tokio::test]
async fn confidential_saves_never_store_the_observation() {
    let store = Arc::new(SledHub::temporary().unwrap());
    let desk = desk_with(store.clone(), None);
    for i in 0..3 {
        desk.generate("s", form("S7", Category::FamilyIssue, &format!("家中爭吵細節 {}", i)))
            .await
            .unwrap();
        let outcome = desk
            .save(
                "s",
                SaveRequest {
                    confidential: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.record.raw_observation, REDACTED_PLACEHOLDER);
    }
    for row in store.scan_all().await.unwrap() {
        assert_eq!(row[5], REDACTED_PLACEHOLDER);
        assert!(!row.iter().any(|c| c.contains("家中爭吵細節")));
    }
}

#[tokio::test]
async fn history_is_exact_per_student() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    for id in ["S1", "S10", "S1", " S1 ", "S2"] {
        desk.generate("s", form(id, Category::Other, "例行晤談")).await.unwrap();
        desk.save("s", SaveRequest::default()).await.unwrap();
    }
    let history = desk.history("S1").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.student_id == "S1"));
    assert!(desk.history("S3").await.unwrap().is_empty());
    assert!(matches!(desk.history("  ").await, Err(DeskError::MissingStudentId)));
}

#[tokio::test]
async fn save_requires_a_draft_and_a_student_id() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    assert!(matches!(
        desk.save("s", SaveRequest::default()).await,
        Err(DeskError::NoDraft)
    ));

    desk.generate("s", form("", Category::Other, "觀察")).await.unwrap();
    assert!(matches!(
        desk.save("s", SaveRequest::default()).await,
        Err(DeskError::MissingStudentId)
    ));

    let outcome = desk
        .save(
            "s",
            SaveRequest {
                student_id: Some("S55".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.student_id, "S55");
}

#[tokio::test]
async fn empty_observation_is_rejected_before_generation() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    let err = desk
        .generate("s", form("S1", Category::Other, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::MissingObservation));
    assert_eq!(err.user_message(), "⚠️ 請輸入觀察內容");
}

#[tokio::test]
async fn high_risk_alert_waits_for_confirmation() {
    let outbox = Arc::new(Outbox::default());
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), Some(outbox.clone()));

    desk.generate("s", form("S9", Category::SelfHarmRisk, "學生提到想輕生"))
        .await
        .unwrap();
    let outcome = desk.save("s", SaveRequest::default()).await.unwrap();
    let AlertStatus::Pending { alert_id } = outcome.alert.clone() else {
        panic!("expected pending alert, got {:?}", outcome.alert);
    };
    assert!(outbox.sent.lock().unwrap().is_empty());

    // Another session cannot confirm it.
    assert!(matches!(
        desk.confirm_alert("other", &alert_id).await,
        Err(DeskError::UnknownAlert(_))
    ));

    outbox.fail.store(true, Ordering::SeqCst);
    let status = desk.confirm_alert("s", &alert_id).await.unwrap();
    assert!(matches!(status, AlertStatus::Failed { .. }));

    outbox.fail.store(false, Ordering::SeqCst);
    assert_eq!(desk.confirm_alert("s", &alert_id).await.unwrap(), AlertStatus::Sent);
    let sent = outbox.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("S9"));
}

#[tokio::test]
async fn immediate_alerts_when_confirmation_is_off() {
    let outbox = Arc::new(Outbox::default());
    let mut config = HubConfig::default();
    config.alerts.require_confirmation = false;
    let desk = CounselingDesk::new(
        config,
        Arc::new(KeywordGenerator),
        Hub::new(Arc::new(SledHub::temporary().unwrap())),
        Some(outbox.clone() as Arc<dyn AlertNotifier>),
    );
    desk.generate("s", form("S9", Category::SelfHarmRisk, "學生提到想輕生"))
        .await
        .unwrap();
    let outcome = desk.save("s", SaveRequest::default()).await.unwrap();
    assert_eq!(outcome.alert, AlertStatus::Sent);
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn high_risk_without_mailer_is_reported() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    desk.generate("s", form("S9", Category::SelfHarmRisk, "學生提到想輕生"))
        .await
        .unwrap();
    let outcome = desk.save("s", SaveRequest::default()).await.unwrap();
    assert_eq!(outcome.alert, AlertStatus::Unconfigured);
    assert_eq!(outcome.record.risk_level, RiskLevel::High);
}

#[tokio::test]
async fn failed_append_keeps_the_draft() {
    let store = Arc::new(FlakyStore {
        inner: SledHub::temporary().unwrap(),
        fail: AtomicBool::new(true),
    });
    let desk = desk_with(store.clone(), None);
    desk.generate("s", form("S3", Category::BehavioralIssue, "上課趴睡"))
        .await
        .unwrap();

    let err = desk.save("s", SaveRequest::default()).await.unwrap_err();
    assert!(matches!(err, DeskError::Hub(HubError::Permission(_))));
    assert!(desk.drafts().draft("s").is_some());

    store.fail.store(false, Ordering::SeqCst);
    desk.save("s", SaveRequest::default()).await.unwrap();
    assert!(desk.drafts().draft("s").is_none());
    assert_eq!(store.scan_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn drifted_hub_refuses_saves() {
    let store = Arc::new(SledHub::temporary().unwrap());
    store
        .write_header(&["Timestamp".to_string(), "Student".to_string(), "Notes".to_string()])
        .await
        .unwrap();
    let desk = desk_with(store.clone(), None);
    desk.generate("s", form("S3", Category::Other, "觀察")).await.unwrap();
    let err = desk.save("s", SaveRequest::default()).await.unwrap_err();
    assert!(matches!(err, DeskError::Hub(HubError::SchemaDrift { .. })));
    assert!(store.scan_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn stats_group_saved_records() {
    let desk = desk_with(Arc::new(SledHub::temporary().unwrap()), None);
    let cases = [
        ("S1", Category::AcademicStress, "成績下滑"),
        ("S2", Category::InterpersonalConflict, "與同學衝突"),
        ("S3", Category::AcademicStress, "考試焦慮"),
    ];
    for (id, cat, obs) in cases {
        desk.generate("s", form(id, cat, obs)).await.unwrap();
        desk.save("s", SaveRequest::default()).await.unwrap();
    }
    let stats = desk.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_category[&Category::AcademicStress], 2);
    assert_eq!(stats.by_risk_level[&RiskLevel::Medium], 1);
    assert_eq!(stats.by_risk_level[&RiskLevel::Low], 2);
}

struct SilentGenerator;

#[async_trait]
impl TextGenerator for SilentGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, NarrativeError> {
        Ok("  \n".into())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, NarrativeError> {
        Ok(Vec::new())
    }

    fn model(&self) -> &str {
        "silent"
    }
}

#[tokio::test]
async fn blank_model_reply_is_an_error_not_a_draft() {
    let desk = CounselingDesk::new(
        HubConfig::default(),
        Arc::new(SilentGenerator),
        Hub::new(Arc::new(SledHub::temporary().unwrap())),
        None,
    );
    let err = desk
        .generate("s", form("S1", Category::Other, "觀察"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::Narrative(NarrativeError::EmptyResponse)));
    assert!(desk.drafts().draft("s").is_none());
}

/// Write-up call succeeds; the action/communication call answers or fails on demand.
struct TwoStepGenerator {
    actions_down: bool,
}

#[async_trait]
impl TextGenerator for TwoStepGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError> {
        if prompt.contains("後續行動建議") {
            if self.actions_down {
                return Err(NarrativeError::Api {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            return Ok("【後續行動建議】每週晤談一次。\n【溝通草稿】家長您好。".into());
        }
        Ok("風險等級：低\n個案描述：依觀察內容整理。".into())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, NarrativeError> {
        Ok(Vec::new())
    }

    fn model(&self) -> &str {
        "two-step"
    }
}

fn two_step_desk(store: Arc<dyn RecordStore>, actions_down: bool) -> CounselingDesk {
    CounselingDesk::new(
        HubConfig::default(),
        Arc::new(TwoStepGenerator { actions_down }),
        Hub::new(store),
        None,
    )
}

async fn stream_draft(desk: &CounselingDesk, session: &str, form: FormInput) -> counsel_hub_core::DraftView {
    let mut chunks = desk.generate_stream(&form).await.unwrap();
    let mut collected = String::new();
    while let Some(chunk) = chunks.next().await {
        collected.push_str(&chunk.unwrap());
    }
    desk.finish_stream(session, form, collected).await.unwrap()
}

#[tokio::test]
async fn streamed_draft_saves_with_actions() {
    let store = Arc::new(SledHub::temporary().unwrap());
    let desk = two_step_desk(store.clone(), false);

    let view = stream_draft(&desk, "s", form("S7", Category::FamilyIssue, "晚歸")).await;
    let actions = view.actions.clone().unwrap();
    assert!(actions.contains("後續行動建議"));
    assert!(view.action_error.is_none());
    assert!(view.generated_text.contains(&actions));

    desk.save("s", SaveRequest::default()).await.unwrap();
    let rows = store.scan_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0][6].contains("個案描述"));
    assert!(rows[0][6].contains("溝通草稿"));
}

#[tokio::test]
async fn failed_action_call_keeps_the_write_up() {
    let store = Arc::new(SledHub::temporary().unwrap());
    let desk = two_step_desk(store.clone(), true);

    let view = desk
        .generate("s", form("S8", Category::AcademicStress, "成績下滑"))
        .await
        .unwrap();
    assert!(view.actions.is_none());
    assert!(view.action_error.as_deref().unwrap().contains("503"));
    assert_eq!(view.generated_text, view.write_up.trim());

    desk.save("s", SaveRequest::default()).await.unwrap();
    let rows = store.scan_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][6], view.write_up.trim());
}

#[tokio::test]
async fn failed_action_call_after_stream_keeps_the_write_up() {
    let store = Arc::new(SledHub::temporary().unwrap());
    let desk = two_step_desk(store.clone(), true);

    let view = stream_draft(&desk, "s", form("S9", Category::Other, "觀察")).await;
    assert!(view.actions.is_none());
    assert!(view.action_error.is_some());

    desk.save("s", SaveRequest::default()).await.unwrap();
    assert_eq!(store.scan_all().await.unwrap().len(), 1);
}
