//! Keyword extraction and lexical scoring.
//!
//! Used in two places: query-variant expansion (a short query's keywords
//! are searched as extra variants) and the lexical fallback that keeps
//! retrieval working when no embedding backend is reachable.
//!
//! Tokenization is intentionally simple: alphabetic/numeric runs become
//! lowercase word tokens, and runs of CJK characters additionally yield
//! overlapping two-character tokens, which approximates word segmentation
//! well enough for ranking.

use std::collections::HashMap;

/// Extract up to `top_k` keywords, ranked by frequency and then by first
/// occurrence. Single-character tokens are ignored.
pub fn extract_keywords(text: &str, top_k: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, token) in tokens.iter().enumerate() {
        let entry = counts.entry(token.as_str()).or_insert((0, position));
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    ranked
        .into_iter()
        .take(top_k)
        .map(|(token, _, _)| token.to_string())
        .collect()
}

/// Score how well `content` matches a keyword set.
///
/// Each keyword contributes its occurrence count, weighted so that early
/// occurrences count more. Returns `0.0` when nothing matches.
pub fn lexical_score(content: &str, keywords: &[String]) -> f64 {
    let content_lower = content.to_lowercase();
    let mut score = 0.0;
    for keyword in keywords {
        let keyword = keyword.to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        let count = content_lower.matches(&keyword).count();
        if count == 0 {
            continue;
        }
        let position = content_lower.find(&keyword).unwrap_or(0);
        let position_weight = 1.0 / (1.0 + position as f64 / 100.0);
        score += count as f64 * (0.5 + position_weight);
    }
    score
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{3040}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}')
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, tokens: &mut Vec<String>| {
        if word.chars().count() > 1 {
            tokens.push(word.to_lowercase());
        }
        word.clear();
    };
    let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        if run.len() == 2 {
            tokens.push(run.iter().collect());
        } else if run.len() > 2 {
            for pair in run.windows(2) {
                tokens.push(pair.iter().collect());
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.push(c);
        } else {
            flush_word(&mut word, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);
    tokens
}
