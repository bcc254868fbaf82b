//! Parser for question/answer structured imports.
//!
//! Import text is split into blocks on blank lines. A block qualifies as a
//! QA block when it carries both a question and an answer line, introduced
//! by a recognized marker. Markers are matched case-insensitively and
//! accept both ASCII (`:`) and full-width (`：`) colons, in English and
//! Chinese.

use crate::chunk::split_paragraphs;

/// One parsed question/answer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaBlock {
    /// The block exactly as it appeared in the import, used as the stored
    /// content.
    pub full_text: String,
    pub question: String,
    /// Alternative phrasings of the question, newline-joined. May be empty.
    pub similar_questions: String,
    pub answer: String,
}

impl QaBlock {
    /// The text embedded for retrieval: the question plus its alternative
    /// phrasings. Indexing questions rather than answers makes short user
    /// queries land on the right block.
    pub fn index_text(&self) -> String {
        if self.similar_questions.is_empty() {
            self.question.clone()
        } else {
            format!("{}\n{}", self.question, self.similar_questions)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Question,
    SimilarQuestions,
    Answer,
}

const QUESTION_MARKERS: &[&str] = &["question", "问题"];
const SIMILAR_MARKERS: &[&str] = &["similar-questions", "similar questions", "相似问"];
const ANSWER_MARKERS: &[&str] = &["answer", "答案"];

/// Parse text into QA blocks. Blocks missing either a question or an
/// answer are dropped; returns an empty vec when the text has no QA
/// structure at all, which callers treat as the signal to fall back to
/// plain chunking.
pub fn parse_qa_blocks(text: &str) -> Vec<QaBlock> {
    let mut blocks = Vec::new();

    for raw_block in split_paragraphs(text) {
        let mut block = QaBlock {
            full_text: raw_block.to_string(),
            question: String::new(),
            similar_questions: String::new(),
            answer: String::new(),
        };
        let mut current: Option<Section> = None;

        for line in raw_block.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = strip_marker(line, QUESTION_MARKERS) {
                current = Some(Section::Question);
                block.question = rest.to_string();
            } else if let Some(rest) = strip_marker(line, SIMILAR_MARKERS) {
                current = Some(Section::SimilarQuestions);
                block.similar_questions = rest.to_string();
            } else if let Some(rest) = strip_marker(line, ANSWER_MARKERS) {
                current = Some(Section::Answer);
                block.answer = rest.to_string();
            } else if let Some(section) = current {
                let target = match section {
                    Section::Question => &mut block.question,
                    Section::SimilarQuestions => &mut block.similar_questions,
                    Section::Answer => &mut block.answer,
                };
                if !target.is_empty() {
                    target.push('\n');
                }
                target.push_str(line);
            }
        }

        if !block.question.is_empty() && !block.answer.is_empty() {
            blocks.push(block);
        }
    }

    blocks
}

/// If the line starts with one of `markers` followed by a colon (ASCII or
/// full-width), return the trimmed remainder.
fn strip_marker<'a>(line: &'a str, markers: &[&str]) -> Option<&'a str> {
    for marker in markers {
        let Some(rest) = strip_prefix_ci(line, marker) else {
            continue;
        };
        let rest = rest.trim_start();
        if let Some(rest) = rest.strip_prefix(':').or_else(|| rest.strip_prefix('：')) {
            return Some(rest.trim());
        }
    }
    None
}

/// Case-insensitive prefix strip; ASCII-only folding is enough because the
/// non-ASCII markers have no case.
fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() < prefix.len() {
        return None;
    }
    let Some(head) = line.get(..prefix.len()) else {
        return None;
    };
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
