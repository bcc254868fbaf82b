//! Placeholder protection for terminology-safe translation.
//!
//! Protected terms are swapped for short numbered tokens (`[T1]`, `[T2]`,
//! …) before the text is handed to an external generation model, and
//! swapped back afterwards. The tokens are deliberately low-entropy:
//! models rarely translate or pluralize them, but they do reformat them,
//! so restoration has to recognize a family of drift variants (inserted
//! whitespace, dropped or doubled brackets, parenthesised and LaTeX-like
//! `\[ T_1 \]` wrappings) before falling back to stripping anything that
//! still looks like a placeholder.

use regex::Regex;
use serde::Serialize;

use crate::models::TermMatch;

/// Request-scoped mapping from placeholder token to target term.
///
/// Lives for exactly one translation call and is never persisted.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderMap {
    slots: Vec<Slot>,
}

#[derive(Debug, Clone)]
struct Slot {
    number: usize,
    token: String,
    target: String,
}

impl PlaceholderMap {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Iterate `(token, target)` pairs in numbering order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots
            .iter()
            .map(|s| (s.token.as_str(), s.target.as_str()))
    }

    fn target_for_number(&self, number: usize) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.number == number)
            .map(|s| s.target.as_str())
    }
}

/// Replace every matched span in `text` with a numbered placeholder token.
///
/// Each match that is actually present in the text produces exactly one
/// token; all occurrences of the span are replaced with it. Matches whose
/// span no longer appears (swallowed by an earlier, longer replacement)
/// are skipped. Callers should pass matches longest-span first.
pub fn protect(text: &str, matches: &[TermMatch]) -> (String, PlaceholderMap) {
    let mut protected = text.to_string();
    let mut slots = Vec::new();

    for m in matches {
        if m.source_span.is_empty() || m.chosen_target.is_empty() {
            continue;
        }
        if !protected.contains(&m.source_span) {
            continue;
        }
        let number = slots.len() + 1;
        let token = format!("[T{number}]");
        protected = protected.replace(&m.source_span, &token);
        slots.push(Slot {
            number,
            token,
            target: m.chosen_target.clone(),
        });
    }

    (protected, PlaceholderMap { slots })
}

/// Outcome of a restoration pass.
#[derive(Debug, Clone)]
pub struct Restored {
    pub text: String,
    /// Placeholder occurrences successfully swapped back.
    pub restored: usize,
    /// Placeholder-shaped fragments that matched no known id and were
    /// removed from the output.
    pub stripped: Vec<String>,
}

/// Swap placeholder tokens in generated output back to their target terms.
///
/// Three stages: exact token replacement, per-id drift patterns, and a
/// final sweep that resolves or strips anything still placeholder-shaped.
/// Brackets left orphaned around a restored term are cleaned afterwards.
pub fn restore(output: &str, map: &PlaceholderMap) -> Restored {
    if map.is_empty() {
        return Restored {
            text: output.to_string(),
            restored: 0,
            stripped: Vec::new(),
        };
    }

    let mut text = output.to_string();
    let mut restored = 0usize;

    // Exact matches first.
    for slot in &map.slots {
        let hits = text.matches(&slot.token).count();
        if hits > 0 {
            text = text.replace(&slot.token, &slot.target);
            restored += hits;
        }
    }

    // Drift variants, one compiled pattern per placeholder id.
    for slot in &map.slots {
        let pattern = drift_pattern(slot.number);
        let hits = pattern.find_iter(&text).count();
        if hits > 0 {
            text = pattern.replace_all(&text, slot.target.as_str()).into_owned();
            restored += hits;
        }
    }

    // Anything still placeholder-shaped either maps to a known id through
    // its number or gets stripped.
    let mut stripped = Vec::new();
    let residual = residual_pattern();
    text = residual
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let number = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .and_then(|m| m.as_str().parse::<usize>().ok());
            match number.and_then(|n| map.target_for_number(n)) {
                Some(target) => {
                    restored += 1;
                    target.to_string()
                }
                None => {
                    stripped.push(caps[0].to_string());
                    String::new()
                }
            }
        })
        .into_owned();

    text = clean_orphan_brackets(&text, map);
    text = tidy_spacing(&text);

    Restored {
        text,
        restored,
        stripped,
    }
}

/// A problem detected in generated output after restoration.
///
/// Serializable so callers can hand the list to a UI or log pipeline
/// without parsing prose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityIssue {
    #[error("translation output is empty")]
    EmptyOutput,
    #[error("placeholder {token} was not restored")]
    UnrestoredPlaceholder { token: String },
    #[error("placeholder-shaped fragment left in output: {found}")]
    ResidualPlaceholder { found: String },
    #[error("output contains added explanation text: {fragment}")]
    ExplanationAdded { fragment: String },
    #[error("term '{term}' missing its required rendering '{expected}'")]
    MissingTerm {
        #[serde(rename = "source")]
        term: String,
        expected: String,
    },
}

/// Boilerplate the generator likes to append instead of (or around) the
/// translation.
const EXPLANATION_FRAGMENTS: &[&str] = &[
    "不过这里的术语可能需要",
    "如果你能提供更多的背景信息",
    "注：",
    "（注：",
    "这里的术语似乎是",
    "请根据具体情境理解",
    "note: the term",
    "i cannot translate",
    "as an ai",
    "here is the translation",
];

/// Check restored output: placeholders gone, text non-empty, no appended
/// model commentary, and every matched term's chosen rendering present.
pub fn validate(text: &str, map: &PlaceholderMap, matches: &[TermMatch]) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    if text.trim().is_empty() {
        issues.push(QualityIssue::EmptyOutput);
        return issues;
    }

    for slot in &map.slots {
        if text.contains(&slot.token) {
            issues.push(QualityIssue::UnrestoredPlaceholder {
                token: slot.token.clone(),
            });
        }
    }

    if !map.is_empty() {
        for found in residual_pattern().find_iter(text) {
            issues.push(QualityIssue::ResidualPlaceholder {
                found: found.as_str().to_string(),
            });
        }
    }

    let lower = text.to_lowercase();
    for fragment in EXPLANATION_FRAGMENTS {
        if lower.contains(&fragment.to_lowercase()) {
            issues.push(QualityIssue::ExplanationAdded {
                fragment: (*fragment).to_string(),
            });
            break;
        }
    }

    for m in matches {
        if m.chosen_target.is_empty() {
            continue;
        }
        if !lower.contains(&m.chosen_target.to_lowercase()) {
            issues.push(QualityIssue::MissingTerm {
                term: m.source_span.clone(),
                expected: m.chosen_target.clone(),
            });
        }
    }

    issues
}

/// Pattern family for one placeholder id: bracketed forms with optional
/// whitespace, underscores, full-width or LaTeX-style brackets, plus the
/// bare `T<n>` form guarded by word boundaries.
fn drift_pattern(number: usize) -> Regex {
    let pattern = format!(
        r"(?i)\\?[\[\(（]\s*T\s*_?\s*{number}\s*\\?[\]\)）]|\bT\s*_?\s*{number}\b"
    );
    Regex::new(&pattern).expect("drift pattern is valid")
}

/// Anything that still looks like a placeholder, id captured. Also covers
/// the spelled-out `TERM`/`TERMINOLOGY` shapes some models produce.
fn residual_pattern() -> Regex {
    Regex::new(
        r"(?i)\\?[\[\(（]\s*T(?:ERM(?:INOLOGY|S)?)?\s*_?\s*(\d+)\s*_*\s*\\?[\]\)）]|\bT(?:ERM(?:INOLOGY|S)?)?\s*_\s*(\d+)\b|\bT(\d+)\b",
    )
    .expect("residual pattern is valid")
}

/// Turn `(term)` / `[term]` left around a successfully restored term into
/// bare `term`.
fn clean_orphan_brackets(text: &str, map: &PlaceholderMap) -> String {
    let mut out = text.to_string();
    for slot in &map.slots {
        let escaped = regex::escape(&slot.target);
        for wrapper in [
            format!(r"[\(（]\s*{escaped}\s*[\)）]"),
            format!(r"\[\s*{escaped}\s*\]"),
        ] {
            let re = Regex::new(&wrapper).expect("bracket pattern is valid");
            out = re.replace_all(&out, slot.target.as_str()).into_owned();
        }
    }
    out
}

/// Collapse space runs introduced by stripping and fix spacing around CJK
/// punctuation. Newlines are left alone so paragraph structure survives.
fn tidy_spacing(text: &str) -> String {
    let spaces = Regex::new(r"[ \t]{2,}").expect("valid");
    let cjk_punct = Regex::new(r"[ \t]+([，。！？；：])").expect("valid");
    let collapsed = spaces.replace_all(text, " ");
    let fixed = cjk_punct.replace_all(&collapsed, "$1");
    fixed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(span: &str, target: &str) -> TermMatch {
        TermMatch {
            source_span: span.to_string(),
            chosen_target: target.to_string(),
            all_targets: vec![target.to_string()],
        }
    }

    #[test]
    fn protect_numbers_tokens_sequentially() {
        let matches = vec![m("引晶", "Neck"), m("放肩", "Crown"), m("等径", "Body")];
        let (text, map) = protect("引晶、放肩、等径都是工艺步骤", &matches);
        assert_eq!(text, "[T1]、[T2]、[T3]都是工艺步骤");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn protect_skips_absent_spans() {
        let matches = vec![m("missing", "x"), m("here", "y")];
        let (text, map) = protect("only here", &matches);
        assert_eq!(text, "only [T1]");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn protect_replaces_every_occurrence_with_one_token() {
        let matches = vec![m("neck", "引晶")];
        let (text, map) = protect("neck then neck again", &matches);
        assert_eq!(text, "[T1] then [T1] again");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn restore_exact_tokens() {
        let (_, map) = protect("结晶", &[m("结晶", "crystal")]);
        let restored = restore("The [T1] process", &map);
        assert_eq!(restored.text, "The crystal process");
        assert_eq!(restored.restored, 1);
        assert!(restored.stripped.is_empty());
    }

    #[test]
    fn restore_handles_inner_whitespace_drift() {
        let (_, map) = protect("结晶", &[m("结晶", "crystal")]);
        assert_eq!(restore("The [ T1 ] process", &map).text, "The crystal process");
        assert_eq!(restore("The [T 1] process", &map).text, "The crystal process");
    }

    #[test]
    fn restore_handles_bracket_style_drift() {
        let (_, map) = protect("结晶", &[m("结晶", "crystal")]);
        assert_eq!(restore("The (T1) process", &map).text, "The crystal process");
        assert_eq!(restore(r"The \[ T_1 \] process", &map).text, "The crystal process");
        assert_eq!(restore("The T_1 process", &map).text, "The crystal process");
        assert_eq!(restore("The T1 process", &map).text, "The crystal process");
    }

    #[test]
    fn restore_does_not_confuse_neighbouring_ids() {
        let matches = vec![m("aa", "first"), m("bb", "second")];
        let (_, map) = protect("aa bb", &matches);
        // Id 1 must not swallow the "1" in "[T12]".
        let restored = restore("[T1] [T2] [T12]", &map);
        assert!(restored.text.starts_with("first second"));
        assert!(!restored.text.contains("[T12]"));
        assert_eq!(restored.stripped.len(), 1);
    }

    #[test]
    fn unknown_residual_tokens_are_stripped() {
        let (_, map) = protect("结晶", &[m("结晶", "crystal")]);
        let restored = restore("[T1] and [T9] leftover", &map);
        assert_eq!(restored.text, "crystal and leftover");
        assert_eq!(restored.stripped, vec!["[T9]".to_string()]);
    }

    #[test]
    fn orphan_brackets_around_restored_term_are_cleaned() {
        let (_, map) = protect("结晶", &[m("结晶", "crystal")]);
        let restored = restore("The ([T1]) process", &map);
        assert_eq!(restored.text, "The crystal process");
    }

    #[test]
    fn empty_map_passes_text_through() {
        let restored = restore("unchanged", &PlaceholderMap::default());
        assert_eq!(restored.text, "unchanged");
        assert_eq!(restored.restored, 0);
    }

    #[test]
    fn echo_round_trip_reproduces_source_with_targets() {
        let matches = vec![m("引晶", "Neck"), m("等径", "Body")];
        let source = "引晶和等径是工艺步骤";
        let (protected, map) = protect(source, &matches);
        let restored = restore(&protected, &map);
        assert_eq!(restored.text, "Neck和Body是工艺步骤");
        assert_eq!(restored.restored, map.len());
    }

    #[test]
    fn validate_flags_unrestored_and_missing() {
        let matches = vec![m("结晶", "crystal")];
        let (_, map) = protect("结晶", &matches);
        let issues = validate("still has [T1]", &map, &matches);
        assert!(issues
            .iter()
            .any(|i| matches!(i, QualityIssue::UnrestoredPlaceholder { .. })));
        let issues = validate("no term here at all", &map, &matches);
        assert!(issues
            .iter()
            .any(|i| matches!(i, QualityIssue::MissingTerm { .. })));
    }

    #[test]
    fn validate_accepts_clean_output() {
        let matches = vec![m("结晶", "crystal")];
        let (_, map) = protect("结晶过程", &matches);
        let issues = validate("the crystal process", &map, &matches);
        assert!(issues.is_empty());
    }

    #[test]
    fn validate_flags_empty_output() {
        let issues = validate("   ", &PlaceholderMap::default(), &[]);
        assert_eq!(issues, vec![QualityIssue::EmptyOutput]);
    }

    #[test]
    fn validate_flags_explanation_text() {
        let matches = vec![m("结晶", "crystal")];
        let (_, map) = protect("结晶", &matches);
        let issues = validate(
            "crystal。不过这里的术语可能需要更多背景",
            &map,
            &matches,
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i, QualityIssue::ExplanationAdded { .. })));
    }

    #[test]
    fn quality_issues_serialize_with_kind_tags() {
        let issue = QualityIssue::MissingTerm {
            term: "结晶".into(),
            expected: "crystal".into(),
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "missing_term");
        assert_eq!(json["expected"], "crystal");
    }
}
