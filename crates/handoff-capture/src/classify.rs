/// Lead-in phrases typical of an assistant reply, matched case-insensitively.
const RESPONSE_MARKERS: &[&str] = &[
    "i'll help you",
    "i can help",
    "based on",
    "here's how",
    "here is how",
    "let me",
    "i understand",
    "to accomplish this",
    "i've completed",
    "i have completed",
    "in summary",
];

/// Heuristic check that clipboard text looks like an agent response worth capturing.
///
/// Text qualifies when it contains at least one known lead-in phrase. Blank
/// text never qualifies.
pub fn looks_like_agent_response(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    // Curly apostrophes are common when text is copied out of chat UIs
    let lower = trimmed.to_lowercase().replace('\u{2019}', "'");
    RESPONSE_MARKERS.iter().any(|marker| lower.contains(marker))
}
