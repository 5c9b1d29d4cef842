//! Risk tagging: reads the model's first output line for a high/medium/low marker.

use crate::record::RiskLevel;

/// Markers per level, checked in priority order (high > medium > low).
const RISK_MARKERS: &[(RiskLevel, &[&str])] = &[
    (RiskLevel::High, &["高", "high"]),
    (RiskLevel::Medium, &["中", "medium", "moderate"]),
    (RiskLevel::Low, &["低", "low"]),
];

/// Outcome of scanning generated text for a risk tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Marker that decided the level; `None` means the low fallback fired.
    pub matched_marker: Option<&'static str>,
}

impl RiskAssessment {
    pub fn is_fallback(&self) -> bool {
        self.matched_marker.is_none()
    }
}

/// Classify generated text by its first non-empty line.
///
/// Unmatched text is tagged `Low`. That default under-reports risk when the model ignores
/// the requested format, so callers should surface `is_fallback()` instead of trusting it.
pub fn classify_risk(generated: &str) -> RiskAssessment {
    let first = generated
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_lowercase();

    for (level, markers) in RISK_MARKERS {
        if let Some(m) = markers.iter().copied().find(|m| first.contains(m)) {
            return RiskAssessment {
                level: *level,
                matched_marker: Some(m),
            };
        }
    }
    RiskAssessment {
        level: RiskLevel::Low,
        matched_marker: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_markers() {
        assert_eq!(classify_risk("風險等級：高\n細節").level, RiskLevel::High);
        assert_eq!(classify_risk("風險等級：中").level, RiskLevel::Medium);
        assert_eq!(classify_risk("風險等級：低").level, RiskLevel::Low);
    }

    #[test]
    fn english_markers_case_insensitive() {
        assert_eq!(classify_risk("Risk: HIGH").level, RiskLevel::High);
        assert_eq!(classify_risk("Risk level - Moderate").level, RiskLevel::Medium);
    }

    #[test]
    fn high_wins_over_lower_markers_on_same_line() {
        let a = classify_risk("low to high, treat as high");
        assert_eq!(a.level, RiskLevel::High);
        assert_eq!(a.matched_marker, Some("high"));
    }

    #[test]
    fn only_first_line_counts() {
        let a = classify_risk("\n  Summary of the session\n風險等級：高");
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.is_fallback());
    }

    #[test]
    fn empty_text_falls_back_to_low() {
        let a = classify_risk("");
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.is_fallback());
    }
}
