//! Terminology-protected translation.
//!
//! An opaque generation model cannot be trusted to carry arbitrary
//! tokens through a translation verbatim, so the guard never asks it to.
//! Matched terms are swapped for low-entropy placeholders before
//! generation and swapped back afterwards, with drift-tolerant recovery
//! and a post-hoc validation pass. When validation fails the guard makes
//! exactly one repair attempt: a follow-up prompt naming the dropped or
//! mangled terms and the offending output. If that also fails, the
//! best-effort text is returned together with a machine-readable list of
//! quality issues; a silently term-corrupted translation is never
//! returned as if it were clean.
//!
//! Each call is self-contained; independent calls can run in parallel
//! against the same read-only dictionary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use termbridge_core::placeholder::{protect, restore, validate, PlaceholderMap};
use termbridge_core::{Error, QualityIssue, TermMatch};

use crate::config::TranslationConfig;
use crate::generation::GenerationPort;
use crate::terms::TermDictionary;

/// Result of one translation call.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The translated text, best-effort when issues remain.
    pub text: String,
    /// Dictionary hits that were protected through the round-trip.
    pub matched_terms: Vec<TermMatch>,
    /// Problems that survived restoration and the repair attempt. Empty
    /// for a clean translation.
    pub quality_issues: Vec<QualityIssue>,
}

/// Translates text while guaranteeing dictionary terms survive the
/// round-trip through an opaque generation model.
pub struct TranslationGuard {
    dictionary: Arc<TermDictionary>,
    generator: Arc<dyn GenerationPort>,
    config: TranslationConfig,
}

impl TranslationGuard {
    pub fn new(
        dictionary: Arc<TermDictionary>,
        generator: Arc<dyn GenerationPort>,
        config: TranslationConfig,
    ) -> Self {
        Self {
            dictionary,
            generator,
            config,
        }
    }

    /// Translate `text` into `target_lang`.
    ///
    /// When `source_lang` is `None` it is inferred from the text (CJK
    /// characters mean Chinese, anything else English). Generation
    /// timeouts are retried once with backoff before surfacing; other
    /// generation failures surface immediately, since there is no
    /// degraded mode for translation.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> Result<Translation> {
        if text.trim().is_empty() {
            return Ok(Translation {
                text: String::new(),
                matched_terms: Vec::new(),
                quality_issues: Vec::new(),
            });
        }

        let source_lang = source_lang
            .map(str::to_string)
            .unwrap_or_else(|| detect_lang(text).to_string());

        let matches = self
            .dictionary
            .find_matches(text, &source_lang, target_lang);
        debug!(count = matches.len(), "terms matched for protection");

        let (protected_text, map) = protect(text, &matches);
        let prompt = translation_prompt(&protected_text, &source_lang, target_lang, !map.is_empty());

        let raw = self.generate_with_timeout_retry(&prompt).await?;
        let cleaned = strip_prompt_noise(&raw);

        let restored = restore(&cleaned, &map);
        for fragment in &restored.stripped {
            warn!(%fragment, "stripped unresolvable placeholder fragment");
        }

        let mut output = restored.text;
        let mut issues = validate(&output, &map, &matches);

        if !issues.is_empty() {
            info!(count = issues.len(), "validation failed, attempting repair");
            match self.repair(text, &output, &issues, &map, target_lang).await {
                Some(repaired) => {
                    let repaired_issues = validate(&repaired, &map, &matches);
                    if repaired_issues.len() < issues.len() {
                        output = repaired;
                        issues = repaired_issues;
                    }
                }
                None => {
                    warn!("repair attempt did not produce usable output");
                }
            }
        }

        if !issues.is_empty() {
            warn!(count = issues.len(), "translation finished with quality issues");
        }

        Ok(Translation {
            text: output,
            matched_terms: matches,
            quality_issues: issues,
        })
    }

    /// One generation call with the configured timeout; a timeout gets a
    /// single retry after backoff, anything else surfaces immediately.
    async fn generate_with_timeout_retry(&self, prompt: &str) -> Result<String, Error> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match self.generator.generate(prompt, timeout).await {
            Ok(text) => Ok(text),
            Err(Error::GenerationTimeout) => {
                warn!("generation timed out, retrying once");
                tokio::time::sleep(Duration::from_secs(self.config.retry_backoff_secs)).await;
                self.generator.generate(prompt, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    /// The single repair pass: ask for a corrected full translation,
    /// naming exactly what was wrong. Returns None when the repair
    /// generation itself fails; the caller keeps the best-effort text.
    async fn repair(
        &self,
        source_text: &str,
        offending_output: &str,
        issues: &[QualityIssue],
        map: &PlaceholderMap,
        target_lang: &str,
    ) -> Option<String> {
        let prompt = repair_prompt(source_text, offending_output, issues, target_lang);
        let raw = match self.generate_with_timeout_retry(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "repair generation failed");
                return None;
            }
        };
        let cleaned = strip_prompt_noise(&raw);
        Some(restore(&cleaned, map).text)
    }
}

/// Guess the source language from character classes: any CJK character
/// means Chinese, otherwise English.
pub fn detect_lang(text: &str) -> &'static str {
    let has_cjk = text.chars().any(|c| {
        matches!(c,
            '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{3040}'..='\u{30ff}')
    });
    if has_cjk {
        "zh"
    } else {
        "en"
    }
}

fn lang_name(code: &str) -> &str {
    match code {
        "zh" => "Chinese",
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "ru" => "Russian",
        "it" => "Italian",
        "pt" => "Portuguese",
        other => other,
    }
}

/// Build the translation prompt. When placeholders are present the model
/// is told, twice and in simple words, to leave them untouched.
fn translation_prompt(
    text: &str,
    source_lang: &str,
    target_lang: &str,
    has_placeholders: bool,
) -> String {
    let source = lang_name(source_lang);
    let target = lang_name(target_lang);
    if has_placeholders {
        format!(
            "Translate the following {source} text into {target}. The text \
             contains placeholder tokens like [T1] and [T2]; copy each one \
             into the translation exactly as written, never translate or \
             reformat them. Output only the translation.\n\n{text}"
        )
    } else {
        format!(
            "Translate the following {source} text into {target}. \
             Output only the translation.\n\n{text}"
        )
    }
}

/// Build the follow-up prompt for the repair pass.
fn repair_prompt(
    source_text: &str,
    offending_output: &str,
    issues: &[QualityIssue],
    target_lang: &str,
) -> String {
    let target = lang_name(target_lang);
    let mut problems = String::new();
    for issue in issues {
        match issue {
            QualityIssue::MissingTerm { term: source, expected } => {
                problems.push_str(&format!("- '{source}' must be rendered as '{expected}'\n"));
            }
            QualityIssue::UnrestoredPlaceholder { token } => {
                problems.push_str(&format!("- the token {token} must not appear in the output\n"));
            }
            QualityIssue::ResidualPlaceholder { found } => {
                problems.push_str(&format!("- remove the stray fragment '{found}'\n"));
            }
            QualityIssue::ExplanationAdded { .. } => {
                problems.push_str("- output only the translation, with no commentary\n");
            }
            QualityIssue::EmptyOutput => {
                problems.push_str("- the translation must not be empty\n");
            }
        }
    }

    format!(
        "Your previous translation has problems:\n{problems}\n\
         Source text:\n{source_text}\n\n\
         Your previous translation:\n{offending_output}\n\n\
         Provide the corrected, complete {target} translation. Output only \
         the translation."
    )
}

/// Remove role prefixes and wrapping noise models prepend to output.
fn strip_prompt_noise(raw: &str) -> String {
    const PREFIXES: &[&str] = &[
        "user:",
        "assistant:",
        "system:",
        "translation:",
        "用户:",
        "助手:",
        "系统:",
        "翻译:",
        "翻译结果:",
        "译文:",
        "翻译：",
        "翻译结果：",
        "译文：",
    ];

    let mut result = raw.trim();
    loop {
        let mut stripped_any = false;
        for prefix in PREFIXES {
            if result.len() >= prefix.len()
                && result
                    .get(..prefix.len())
                    .map(|head| head.eq_ignore_ascii_case(prefix))
                    .unwrap_or(false)
            {
                result = result[prefix.len()..].trim_start();
                stripped_any = true;
            }
        }
        if !stripped_any {
            break;
        }
    }

    result.trim_matches('"').trim().to_string()
}
