use once_cell::sync::Lazy;
use regex::Regex;

// Emoji, pictographs and their joiners/selectors. Transcripts keep plain
// prose; the AI likes to decorate spoken output with these.
static DECORATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\p{Emoji_Presentation}\p{Extended_Pictographic}\u{FE0E}\u{FE0F}\u{200D}\u{20E3}]",
    )
    .expect("decorative symbol pattern is valid")
});

static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("valid pattern"));

/// Strip decorative symbols (emoji, pictographs) from spoken text and
/// collapse the whitespace they leave behind.
///
/// Applied to AI spoken text before it is committed to the transcript, and
/// to persona greetings before they are sent over the channel.
pub fn sanitize_spoken_text(text: &str) -> String {
    let stripped = DECORATIVE_RE.replace_all(text, "");
    let collapsed = MULTI_SPACE_RE.replace_all(stripped.trim(), " ");
    collapsed.into_owned()
}
