use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Completion scores live on a 0-100 scale, whatever the provider says.
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// Default number of feedback levels a session progresses through.
pub const DEFAULT_LEVELS_TOTAL: i32 = 3;

const HEURISTIC_BASE_SCORE: f64 = 60.0;
const POSITIVE_INDICATORS: &[&str] = &["good", "well", "clear", "strong", "effective"];

/// Provider output that cannot be turned into feedback. Content problems are
/// not retried; the pipeline surfaces them as a typed failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("provider returned an empty response")]
    EmptyResponse,
}

/// A span of the student's essay the feedback singles out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HighlightRange {
    /// Byte offset into the submitted essay text (inclusive)
    pub start: usize,
    /// Byte offset into the submitted essay text (exclusive)
    pub end: usize,
    /// Range kind; currently always "improvement"
    pub kind: String,
    /// The sentence of feedback that mentions this span
    pub feedback: String,
    /// Stable id for the client to anchor tooltips ("highlight_1", ...)
    pub id: String,
}

/// Structured result of parsing one raw provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeedback {
    pub html: String,
    pub highlights: Vec<HighlightRange>,
    pub completion_score: f64,
}

/// One immutable draft of a student's essay. Every submission writes a new
/// version row; versions are never edited or deleted.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EssayVersion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub level: i32,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for the feedback pipeline endpoint.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FeedbackRequest {
    /// Current essay text; persisted as a new version regardless of caching
    pub essay_text: String,
    /// Feedback level being requested (1-based)
    pub level: i32,
    /// Skip the cache and always call the provider
    #[serde(default)]
    pub force_refresh: bool,
}

/// Pipeline response. Failures come back with `success: false` and an error
/// code instead of an HTTP error, so the client can always offer a retry.
#[derive(Debug, Serialize, ToSchema)]
pub struct FeedbackResponse {
    pub success: bool,
    /// Whether the result was served from the (version, level) cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted_areas: Option<Vec<HighlightRange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_score: Option<f64>,
    pub level: i32,
    /// Provider latency for fresh results, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<i64>,
    /// Error code on failure (ai_service_unavailable, ai_parse_error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FeedbackResponse {
    pub fn failure(code: &str, message: String, level: i32) -> Self {
        Self {
            success: false,
            cached: None,
            version_id: None,
            feedback_html: None,
            highlighted_areas: None,
            completion_score: None,
            level,
            response_time_ms: None,
            error: Some(code.to_string()),
            error_message: Some(message),
        }
    }
}

/// Clamp a completion score into [0, 100]. Out-of-range provider scores are
/// corrected, never rejected.
pub fn clamp_score(raw: f64) -> f64 {
    raw.clamp(MIN_SCORE, MAX_SCORE)
}

/// Parse one raw provider response against the essay it was generated for.
///
/// The provider is asked to wrap problem spans in
/// `<span class="highlight-target">...</span>` and may emit an explicit
/// `Score:` line. When it doesn't, the score falls back to a heuristic over
/// issue count and feedback tone.
pub fn parse_feedback(raw: &str, essay_text: &str, level: i32) -> Result<ParsedFeedback, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    let highlights = extract_highlights(raw, essay_text);
    let score = match explicit_score(raw) {
        Some(score) => score,
        None => heuristic_score(raw, highlights.len(), level),
    };

    Ok(ParsedFeedback {
        html: format_html(raw),
        highlights,
        completion_score: clamp_score(score),
    })
}

/// Locate each highlight target inside the original essay. Targets that no
/// longer occur in the essay (the provider paraphrased) are dropped.
fn extract_highlights(raw: &str, essay_text: &str) -> Vec<HighlightRange> {
    let re = Regex::new(r#"(?s)<span class="highlight-target">(.*?)</span>"#)
        .expect("highlight regex is valid");

    let mut ranges = Vec::new();
    for (index, capture) in re.captures_iter(raw).enumerate() {
        let target = capture[1].trim();
        if target.is_empty() {
            continue;
        }
        if let Some(start) = essay_text.find(target) {
            ranges.push(HighlightRange {
                start,
                end: start + target.len(),
                kind: "improvement".to_string(),
                feedback: feedback_sentence_for(target, raw),
                id: format!("highlight_{}", index + 1),
            });
        }
    }
    ranges
}

/// Pull the sentence of feedback that mentions the highlighted text, so the
/// client can show it next to the span.
fn feedback_sentence_for(target: &str, raw: &str) -> String {
    let target_lower = target.to_lowercase();
    for sentence in raw.split(['.', '!', '?']) {
        if sentence.to_lowercase().contains(&target_lower) {
            let cleaned = strip_tags(sentence);
            let cleaned = cleaned.trim();
            if !cleaned.is_empty() {
                return format!("{cleaned}.");
            }
        }
    }
    "Consider revising this text for improvement.".to_string()
}

fn strip_tags(fragment: &str) -> String {
    let re = Regex::new(r"<[^>]*>").expect("tag regex is valid");
    re.replace_all(fragment, "").into_owned()
}

/// Explicit `Score: N` line, when the provider emits one. Accepts negative
/// and fractional values; clamping happens in the caller.
fn explicit_score(raw: &str) -> Option<f64> {
    let re = Regex::new(r"(?m)^\s*Score:\s*(-?\d+(?:\.\d+)?)").expect("score regex is valid");
    re.captures(raw)
        .and_then(|capture| capture[1].parse::<f64>().ok())
}

/// Heuristic score used when no explicit score line is present: start at a
/// base, reward fewer flagged issues, reward positive tone.
fn heuristic_score(raw: &str, issues_found: usize, level: i32) -> f64 {
    let max_issues: f64 = match level {
        1 => 10.0,
        2 => 8.0,
        3 => 5.0,
        _ => 8.0,
    };

    let issue_score = ((max_issues - issues_found as f64) / max_issues * 40.0).max(0.0);

    let lower = raw.to_lowercase();
    let positive_count: usize = POSITIVE_INDICATORS
        .iter()
        .map(|indicator| lower.matches(indicator).count())
        .sum();
    let positive_score = (positive_count as f64 * 2.0).min(20.0);

    HEURISTIC_BASE_SCORE + issue_score + positive_score
}

/// Convert the raw feedback into the HTML fragment stored and returned to
/// the client: line breaks preserved, highlight spans rewritten to marks.
fn format_html(raw: &str) -> String {
    let with_breaks = raw.replace('\n', "<br />\n");
    let re = Regex::new(r#"(?s)<span class="highlight-target">(.*?)</span>"#)
        .expect("highlight regex is valid");
    let marked = re.replace_all(&with_breaks, "<mark class=\"essay-highlight\">$1</mark>");
    format!("<div class=\"essaylab-feedback level-feedback\">{marked}</div>")
}

/// Built-in system prompt for a feedback level. Levels follow the original
/// three-stage progression: mechanics, language, structure.
pub fn default_level_prompt(level: i32) -> Option<&'static str> {
    match level {
        1 => Some(
            "Focus on basic grammar, spelling, and punctuation errors. Highlight specific \
             mistakes and provide simple corrections. Identify areas where the student can \
             improve basic writing mechanics. Wrap problematic text in \
             <span class=\"highlight-target\">text to highlight</span> tags.",
        ),
        2 => Some(
            "Analyze language sophistication, word choice, and sentence variety. Suggest more \
             advanced vocabulary and sentence structures. Look for opportunities to improve \
             flow, clarity, and style. Wrap areas needing vocabulary or structural improvement \
             in <span class=\"highlight-target\">text to highlight</span> tags.",
        ),
        3 => Some(
            "Evaluate overall structure, argument development, and content depth. Provide \
             high-level organizational and analytical feedback. Assess thesis strength, \
             evidence quality, and logical flow. Wrap structural issues in \
             <span class=\"highlight-target\">text to highlight</span> tags.",
        ),
        _ => None,
    }
}

/// Assemble the full system prompt sent to the provider for one level.
pub fn build_system_prompt(level: i32, level_instructions: &str) -> String {
    format!(
        "You are providing Level {level} feedback for a student essay as part of a multi-level \
         revision process.\n\nLevel {level} Instructions:\n{level_instructions}\n\n\
         Provide specific, actionable suggestions that can be measured. Use \
         <span class=\"highlight-target\">text to highlight</span> tags around specific text \
         that needs attention, and finish with a line of the form \"Score: N\" rating the \
         essay from 0 to 100 for this level."
    )
}

/// Assemble the user message: optional question context plus the essay.
pub fn build_user_message(essay_text: &str, question_context: Option<&str>) -> String {
    match question_context {
        Some(context) if !context.trim().is_empty() => {
            format!("QUESTION CONTEXT:\n{context}\n\nSTUDENT ESSAY:\n{essay_text}")
        }
        _ => format!("STUDENT ESSAY:\n{essay_text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ParseError, clamp_score, default_level_prompt, explicit_score, extract_highlights,
        parse_feedback,
    };

    const ESSAY: &str = "The cat sat on the mat. It was good weather that day.";

    #[test]
    fn clamp_keeps_in_range_scores() {
        assert_eq!(clamp_score(72.0), 72.0);
        assert_eq!(clamp_score(0.0), 0.0);
        assert_eq!(clamp_score(100.0), 100.0);
    }

    #[test]
    fn clamp_corrects_out_of_range_scores() {
        assert_eq!(clamp_score(150.0), 100.0);
        assert_eq!(clamp_score(-10.0), 0.0);
    }

    #[test]
    fn empty_response_is_a_parse_error() {
        assert_eq!(parse_feedback("", ESSAY, 1), Err(ParseError::EmptyResponse));
        assert_eq!(
            parse_feedback("   \n  ", ESSAY, 1),
            Err(ParseError::EmptyResponse)
        );
    }

    #[test]
    fn explicit_score_line_wins_over_heuristic() {
        let raw = "Score: 85\nStatus: PASS\nNice work overall.";
        let parsed = parse_feedback(raw, ESSAY, 1).unwrap();
        assert_eq!(parsed.completion_score, 85.0);
    }

    #[test]
    fn out_of_range_provider_scores_are_clamped() {
        let high = parse_feedback("Score: 150\nGreat.", ESSAY, 1).unwrap();
        assert_eq!(high.completion_score, 100.0);

        let low = parse_feedback("Score: -10\nRough.", ESSAY, 1).unwrap();
        assert_eq!(low.completion_score, 0.0);
    }

    #[test]
    fn score_line_parses_only_at_line_start() {
        assert_eq!(explicit_score("Score: 42"), Some(42.0));
        assert_eq!(explicit_score("the score: 42 overall"), None);
    }

    #[test]
    fn highlights_are_located_in_the_essay() {
        let raw = r#"Replace <span class="highlight-target">good</span> with a stronger word."#;
        let highlights = extract_highlights(raw, ESSAY);
        assert_eq!(highlights.len(), 1);
        let range = &highlights[0];
        assert_eq!(&ESSAY[range.start..range.end], "good");
        assert_eq!(range.id, "highlight_1");
        assert!(range.feedback.to_lowercase().contains("stronger word"));
    }

    #[test]
    fn highlights_missing_from_essay_are_dropped() {
        let raw = r#"Avoid <span class="highlight-target">utilize</span> here."#;
        assert!(extract_highlights(raw, ESSAY).is_empty());
    }

    #[test]
    fn heuristic_score_stays_in_range() {
        // No issues, very positive tone: must still clamp at 100.
        let raw = "good good good good good good good good good good good work, clear and strong";
        let parsed = parse_feedback(raw, ESSAY, 1).unwrap();
        assert!(parsed.completion_score <= 100.0);
        assert!(parsed.completion_score >= 0.0);
    }

    #[test]
    fn html_wraps_and_rewrites_highlight_spans() {
        let raw = "Line one <span class=\"highlight-target\">good</span>\nLine two";
        let parsed = parse_feedback(raw, ESSAY, 1).unwrap();
        assert!(parsed.html.starts_with("<div class=\"essaylab-feedback"));
        assert!(parsed.html.contains("<mark class=\"essay-highlight\">good</mark>"));
        assert!(parsed.html.contains("<br />"));
    }

    #[test]
    fn prompts_exist_for_the_three_built_in_levels() {
        for level in 1..=3 {
            assert!(default_level_prompt(level).is_some());
        }
        assert!(default_level_prompt(4).is_none());
    }
}
