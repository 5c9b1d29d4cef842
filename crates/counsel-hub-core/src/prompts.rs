//! Instructional templates for the narrative transform.
//!
//! The first-line risk tag requested here is what `risk::classify_risk` reads back.

use crate::record::{Category, TargetType};

/// Professional-record framing, used when the interaction was with the student.
pub const STUDENT_RECORD_PREAMBLE: &str = r#"你是一位資深的學校輔導老師，正在撰寫正式的輔導紀錄。
請將下方的原始觀察改寫為專業、客觀、精簡的輔導紀錄。

規則：
- 第一行必須是「風險等級：高」、「風險等級：中」或「風險等級：低」其中之一
- 以第三人稱描述，避免主觀評價與標籤化用語
- 區分「觀察到的事實」與「輔導老師的評估」
- 不要編造原始觀察中沒有的內容
- 使用繁體中文"#;

/// Parent-communication framing, used when the interaction was with a parent/guardian.
pub const PARENT_RECORD_PREAMBLE: &str = r#"你是一位資深的學校輔導老師，正在整理與家長溝通的紀錄。
請將下方的原始紀錄改寫為專業、溫和、以合作為導向的家長晤談紀錄。

規則：
- 第一行必須是「風險等級：高」、「風險等級：中」或「風險等級：低」其中之一
- 摘要家長關切的重點與雙方達成的共識
- 語氣中立，不評斷家長的教養方式
- 不要編造原始紀錄中沒有的內容
- 使用繁體中文"#;

/// Follow-up: action suggestions plus a message addressed to the student.
pub const STUDENT_ACTION_PREAMBLE: &str = r#"根據下方的輔導紀錄，請提供：
1. 【後續行動建議】三到五點具體、可執行的輔導策略
2. 【溝通草稿】一段可以直接對學生說的鼓勵性談話（約100字）
使用繁體中文，條列清楚。"#;

/// Follow-up: action suggestions plus a note addressed to the guardian.
pub const PARENT_ACTION_PREAMBLE: &str = r#"根據下方的家長晤談紀錄，請提供：
1. 【後續行動建議】三到五點家校合作的具體做法
2. 【溝通草稿】一封給家長的簡短聯絡信（約150字，語氣溫和、尊重）
使用繁體中文，條列清楚。"#;

/// One-line probe used by diagnostics.
pub const DIAGNOSTIC_PROMPT: &str = "你好，請回覆『連線成功』";

pub fn rewrite_preamble(target: TargetType) -> &'static str {
    match target {
        TargetType::Student => STUDENT_RECORD_PREAMBLE,
        TargetType::Parent => PARENT_RECORD_PREAMBLE,
    }
}

pub fn action_preamble(target: TargetType) -> &'static str {
    match target {
        TargetType::Student => STUDENT_ACTION_PREAMBLE,
        TargetType::Parent => PARENT_ACTION_PREAMBLE,
    }
}

/// Concatenate preamble, category context and the raw text. No sanitization is applied.
pub fn build_prompt(preamble: &str, category: Category, raw_text: &str) -> String {
    format!(
        "{}\n\n事件類別：{}\n\n原始內容：\n---\n{}\n---",
        preamble,
        category.label(),
        raw_text.trim()
    )
}
