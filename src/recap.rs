//! Session recap (debrief) generation.
//!
//! After a call ends the full transcript is turned into a structured
//! coaching debrief. The [`RecapGenerator`] trait is the collaborator
//! contract the session manager consumes; [`LlmRecapService`] is the
//! production implementation, walking an OpenAI-compatible provider chain
//! until one returns usable JSON. Every failure mode degrades to a recap
//! record that still carries the raw transcript.

use crate::error::LiveCallError;
use crate::llm_client;
use crate::session::{PersonaProfile, SessionKind, Speaker, TranscriptTurn};
use crate::settings::RecapProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Below this many turns the conversation is too thin to analyze and a
/// canned debrief is returned without calling any provider.
const MIN_TRANSCRIPT_TURNS_FOR_DETAILED_RECAP: usize = 4;

static FENCED_JSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid pattern"));

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VocabEntry {
    pub term: String,
    pub translation: String,
    pub example_sentence: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ImprovementArea {
    /// Category, e.g. "Grammar - Tense" or "Vocabulary Choice".
    pub area_type: String,
    pub user_input_example: Option<String>,
    pub coach_suggestion: String,
    pub explanation: String,
    pub example_with_suggestion: String,
}

/// The structured debrief. Field names mirror the JSON the recap model is
/// instructed to emit, so a response deserializes directly.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecapContent {
    pub conversation_summary: String,
    pub key_topics_discussed: Vec<String>,
    pub new_vocabulary_and_phrases: Vec<VocabEntry>,
    pub good_usage_highlights: Vec<String>,
    pub areas_for_improvement: Vec<ImprovementArea>,
    pub suggested_practice_activities: Vec<String>,
    pub overall_encouragement: String,
}

impl RecapContent {
    /// Minimal recap for a session with no conversation at all.
    pub fn empty_session() -> Self {
        Self {
            conversation_summary: "No conversation took place in this session.".into(),
            key_topics_discussed: vec!["N/A".into()],
            overall_encouragement: "Try chatting a bit next time!".into(),
            ..Self::default()
        }
    }

    /// Canned recap for a conversation too short to analyze.
    pub fn brief_session() -> Self {
        Self {
            conversation_summary:
                "The conversation was very brief, so a detailed debrief couldn't be generated this time. Try having a more extended chat!"
                    .into(),
            key_topics_discussed: vec!["Brief interaction".into()],
            good_usage_highlights: vec!["Engaged in a short practice!".into()],
            suggested_practice_activities: vec![
                "Engage in a conversation for at least a few minutes.".into()
            ],
            overall_encouragement:
                "Every bit of practice helps! Keep going, and aim for longer chats next time."
                    .into(),
            ..Self::default()
        }
    }

    /// Degraded recap recording why generation failed.
    pub fn failure(reason: &str) -> Self {
        Self {
            conversation_summary: format!("Debrief generation failed: {}", reason),
            key_topics_discussed: vec!["N/A - Error".into()],
            overall_encouragement:
                "Could not generate detailed feedback for this session.".into(),
            ..Self::default()
        }
    }

    /// Backfill the fields a model response may have omitted or left blank.
    fn with_fallbacks(mut self) -> Self {
        if self.conversation_summary.trim().is_empty() {
            self.conversation_summary = "Summary could not be generated at this time.".into();
        }
        if self.key_topics_discussed.is_empty() {
            self.key_topics_discussed = vec!["No specific topics noted.".into()];
        }
        if self.overall_encouragement.trim().is_empty() {
            self.overall_encouragement = "Keep up the great work with your practice!".into();
        }
        self.new_vocabulary_and_phrases
            .retain(|entry| !entry.term.trim().is_empty());
        self.areas_for_improvement
            .retain(|area| !area.area_type.trim().is_empty());
        self
    }
}

/// A completed session as handed to the persistence collaborator: the raw
/// transcript plus the (possibly degraded) debrief.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionRecap {
    pub session_id: String,
    pub persona: PersonaProfile,
    pub kind: SessionKind,
    pub started_at: Option<DateTime<Utc>>,
    /// Formatted call duration, e.g. "3m 12s".
    pub duration: String,
    pub transcript: Vec<TranscriptTurn>,
    pub content: RecapContent,
}

#[async_trait]
pub trait RecapGenerator: Send + Sync {
    async fn generate_recap(
        &self,
        transcript: &[TranscriptTurn],
        persona: &PersonaProfile,
    ) -> Result<RecapContent, LiveCallError>;
}

/// Recap generation over an OpenAI-compatible provider fallback chain.
pub struct LlmRecapService {
    providers: Vec<RecapProvider>,
}

impl LlmRecapService {
    pub fn new(providers: Vec<RecapProvider>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl RecapGenerator for LlmRecapService {
    async fn generate_recap(
        &self,
        transcript: &[TranscriptTurn],
        persona: &PersonaProfile,
    ) -> Result<RecapContent, LiveCallError> {
        if transcript.len() < MIN_TRANSCRIPT_TURNS_FOR_DETAILED_RECAP {
            info!(
                "Transcript too short for a detailed recap ({} turns, need {})",
                transcript.len(),
                MIN_TRANSCRIPT_TURNS_FOR_DETAILED_RECAP
            );
            return Ok(RecapContent::brief_session());
        }

        let user_prompt = build_recap_prompt(transcript, persona);
        let system_prompt = "You are an AI assistant specialized in generating language learning \
                             session debriefs. Your output must be a single, valid JSON object \
                             matching the detailed structure provided by the user. Adhere strictly \
                             to the requested keys and formats.";

        let mut errors = Vec::new();
        for provider in &self.providers {
            if provider.api_key.trim().is_empty() {
                warn!("Recap provider {} has no API key, skipping", provider.id);
                errors.push(format!("{}: not configured", provider.id));
                continue;
            }

            info!(
                "Requesting session recap from {} (model {})",
                provider.label, provider.model
            );
            match llm_client::send_chat_completion(provider, system_prompt, &user_prompt, true)
                .await
            {
                Ok(Some(body)) => match parse_recap_response(&body) {
                    Ok(content) => return Ok(content),
                    Err(err) => {
                        warn!("Recap response from {} unusable: {}", provider.id, err);
                        errors.push(format!("{}: {}", provider.id, err));
                    }
                },
                Ok(None) => {
                    warn!("Recap provider {} returned an empty choice", provider.id);
                    errors.push(format!("{}: empty response", provider.id));
                }
                Err(err) => {
                    warn!("Recap provider {} failed: {}", provider.id, err);
                    errors.push(format!("{}: {}", provider.id, err));
                }
            }
        }

        if errors.is_empty() {
            errors.push("no recap providers configured".to_string());
        }
        Err(LiveCallError::Recap(errors.join("; ")))
    }
}

/// Render the transcript the way the recap model sees it, marking which
/// turns were spoken rather than typed.
fn render_transcript(transcript: &[TranscriptTurn], persona: &PersonaProfile) -> String {
    let mut text = String::from("Conversation Transcript (User vs. AI Partner):\n");
    for turn in transcript {
        let (speaker, content) = match turn.speaker {
            Speaker::UserSpoken => ("User", format!("(User spoke): {}", turn.text)),
            Speaker::UserTyped => ("User", turn.text.clone()),
            Speaker::AiSpoken => (
                persona.name.as_str(),
                format!("({} spoke): {}", persona.name, turn.text),
            ),
            Speaker::System => ("System", turn.text.clone()),
        };
        text.push_str(&format!("{}: {}\n", speaker, content));
    }
    text
}

fn build_recap_prompt(transcript: &[TranscriptTurn], persona: &PersonaProfile) -> String {
    format!(
        r#"You are an expert, friendly, and encouraging language learning coach for a user learning {language}.
Analyze the following conversation transcript between the "User" and an "AI Partner" (named {name}, who was speaking primarily in {language}).
Your entire output MUST BE a single, valid JSON object. Do NOT include any text before or after the JSON object itself. Do not use markdown code blocks.
The JSON object MUST strictly adhere to the following structure with ALL specified top-level keys:
- "conversationSummary": (string) A brief 2-3 sentence overview of the conversation.
- "keyTopicsDiscussed": (array of strings) 3-5 main subjects talked about.
- "newVocabularyAndPhrases": (array of objects) 2-4 useful items in {language}, each {{ "term": "...", "translation": "concise English translation", "exampleSentence": "..." }}.
- "goodUsageHighlights": (array of strings) 1-3 instances where the User used {language} well.
- "areasForImprovement": (array of objects) 2-3 areas, each {{ "areaType": "category", "userInputExample": "the User's phrase or null", "coachSuggestion": "...", "explanation": "...", "exampleWithSuggestion": "..." }}.
- "suggestedPracticeActivities": (array of strings) 1-2 actionable suggestions.
- "overallEncouragement": (string) A short, positive closing remark.

TRANSCRIPT TO ANALYZE:
{transcript}

Remember: ONLY the JSON object. All string values within the JSON must be properly escaped."#,
        language = persona.language,
        name = persona.name,
        transcript = render_transcript(transcript, persona),
    )
}

/// Strip a BOM plus leading/trailing whitespace and control characters;
/// some providers pad their JSON with both.
fn clean_json_string(raw: &str) -> &str {
    raw.trim_start_matches('\u{FEFF}')
        .trim_matches(|c: char| c.is_whitespace() || c.is_control())
}

/// Parse a recap response body: direct JSON first, then a fenced code
/// block as a fallback for models that ignore the no-markdown instruction.
fn parse_recap_response(raw: &str) -> Result<RecapContent, String> {
    let cleaned = clean_json_string(raw);
    match serde_json::from_str::<RecapContent>(cleaned) {
        Ok(content) => return Ok(content.with_fallbacks()),
        Err(err) => {
            warn!("Direct recap JSON parse failed: {}", err);
        }
    }

    if let Some(fenced) = FENCED_JSON_RE.captures(raw).and_then(|c| c.get(1)) {
        return serde_json::from_str::<RecapContent>(clean_json_string(fenced.as_str()))
            .map(RecapContent::with_fallbacks)
            .map_err(|err| format!("malformed JSON after markdown extraction: {}", err));
    }

    Err("response was not valid JSON and contained no code block".to_string())
}
