//! Classification boundary over the LLM endpoint.
//!
//! Free text goes in, a strict tagged union comes out. Anything the model
//! returns that does not fit one of the three known variants is rejected
//! here instead of leaking an untyped mapping deeper into the bot.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::audio::features::FeatureVector;
use crate::openai;

/// Normalized classifier output for one user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedResponse {
    ChitChat { text: String },
    Card { text: String, image_link: String },
    Meme { image_link: String },
}

/// Result of the voice emotion pipeline. Not persisted.
#[derive(Debug, Deserialize)]
pub struct AudioAnalysis {
    #[serde(default)]
    pub transcription: String,
    #[serde(default, deserialize_with = "emotion_map_or_label")]
    pub emotion: HashMap<String, f32>,
    #[serde(default)]
    pub depression_score: f32,
    #[serde(default)]
    pub ai_response: String,
}

#[derive(Debug)]
pub enum ClassifyError {
    /// The LLM call itself failed.
    Api(openai::Error),
    /// Structured output could not be parsed.
    Malformed(String),
    /// Output parsed but the tag is not one of the known variants.
    UnrecognizedVariant(String),
}

impl std::fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api(e) => write!(f, "classifier call failed: {e}"),
            Self::Malformed(e) => write!(f, "malformed classifier output: {e}"),
            Self::UnrecognizedVariant(tag) => write!(f, "unrecognized answer_type '{tag}'"),
        }
    }
}

impl std::error::Error for ClassifyError {}

/// Seam between the dispatcher and the LLM, mockable in tests.
#[allow(async_fn_in_trait)]
pub trait Classify {
    async fn classify_text(&self, text: &str) -> Result<ClassifiedResponse, ClassifyError>;
    async fn analyze_voice(
        &self,
        wav_base64: &str,
        features: &FeatureVector,
    ) -> Result<AudioAnalysis, ClassifyError>;
}

/// Major Arcana assets the model picks from.
const CARD_IMAGES: &[(&str, &str)] = &[
    ("0", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619457/q0ijgklymbjpp3efplna.jpg"),
    ("I", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619436/ylvr8vjpl09grcpjufob.jpg"),
    ("II", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619445/xcxbhpptmfeool6xubpn.jpg"),
    ("III", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619436/cx1rxypkzo8r9obzgcu2.jpg"),
    ("IV", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619450/vpw9dkvtf6iupjimfx5m.jpg"),
    ("V", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619453/fx66qkbq5xplbxopthyd.jpg"),
    ("VI", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619437/o4rzusteygd4twzygcal.jpg"),
    ("VII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619439/tlfum4e37hcozutsxvxl.jpg"),
    ("VIII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619448/ybutnri9i1x8sgopor7b.jpg"),
    ("IX", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619443/vb90e7jbmljqawr0qsdz.jpg"),
    ("X", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619440/k5cafz3xi9z7wfywpqba.jpg"),
    ("XI", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619456/w6kivdlgq5frgmwxnjta.jpg"),
    ("XII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619451/okjurztgfssnrqaxniyi.jpg"),
    ("XIII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619442/rmzqttnjtyezvpdwtze1.jpg"),
    ("XIV", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619434/vahjqteh7yv41kgo58bq.jpg"),
    ("XV", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619439/dtdi8rcywfgzdsukz4jk.jpg"),
    ("XVI", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619449/onifs9cuzhfalmxya3qw.jpg"),
    ("XVII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619447/sm8oeyjm58w283uyxkju.jpg"),
    ("XVIII", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619446/gapo7gqqpmppppfm39wp.jpg"),
    ("XIX", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619455/k5qcy8vfjkddory2ze5i.jpg"),
    ("XX", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619454/jx8age5z8ag80g5l78mp.jpg"),
    ("XXI", "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619443/xsxjtvymqnlid7mfqvgq.jpg"),
];

fn text_system_prompt() -> String {
    let card_list: String = CARD_IMAGES
        .iter()
        .map(|(name, url)| format!("  {name}: {url}\n"))
        .collect();

    format!(
        r#"You are Gini, a warm tarot-reading assistant. Analyze the sentiment of the user's message (it may not be in English) and answer with a JSON object:

{{"answer_type": "card" | "chit-chat" | "meme", "response": {{"text": "...", "image_link": "..."}}}}

Rules:
- "card": when the sentiment shows a clear emotional direction. Pick one Major Arcana card, set "image_link" to its URL from the list below, and set "text" to a brief reading of the card in the light of the user's message, ending with a question that keeps the conversation going.
- "chit-chat": when the sentiment is neutral or the context suggests conversation; set "text" to an engaging conversational reply.
- "meme": when the sentiment suggests humor; set "image_link" to a GIF that will open in Telegram.
- Pick exactly one answer_type. Return the JSON object only, no markdown fences.

Major Arcana images:
{card_list}"#
    )
}

const AUDIO_SYSTEM_PROMPT: &str = r#"You process a voice message: transcribe it, then analyze the speech for emotions following Ekman's theory (anger, disgust, fear, happiness, sadness, surprise, neutral) and for early linguistic signs of depression. Acoustic features measured from the recording are provided as additional context.

Return a valid JSON object only, without backticks or markdown formatting:
{
  "transcription": "the transcribed speech",
  "emotion": {"<label>": <confidence 0..1>, ...},
  "depression_score": <0..1>,
  "ai_response": "a short empathetic reply to the speaker"
}"#;

/// Strip ```json fences the model sometimes wraps around its output.
fn strip_code_fences(reply: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence =
        FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());
    match fence.captures(reply) {
        Some(caps) => caps[1].to_string(),
        None => reply.trim().to_string(),
    }
}

#[derive(Deserialize)]
struct RawReply {
    answer_type: String,
    #[serde(default)]
    response: RawContent,
}

#[derive(Deserialize, Default)]
struct RawContent {
    text: Option<String>,
    image_link: Option<String>,
}

/// Defaults substituted when the model omits a field.
#[derive(Clone)]
pub struct Fallbacks {
    pub card_image: String,
    pub meme_image: String,
}

fn normalize(reply: &str, fallbacks: &Fallbacks) -> Result<ClassifiedResponse, ClassifyError> {
    let cleaned = strip_code_fences(reply);
    let raw: RawReply = serde_json::from_str(&cleaned)
        .map_err(|e| ClassifyError::Malformed(e.to_string()))?;

    match raw.answer_type.as_str() {
        "chit-chat" => Ok(ClassifiedResponse::ChitChat {
            text: raw
                .response
                .text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Let's chat! What's on your mind?".to_string()),
        }),
        "card" => Ok(ClassifiedResponse::Card {
            text: raw
                .response
                .text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Here is your tarot reading.".to_string()),
            image_link: raw
                .response
                .image_link
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| fallbacks.card_image.clone()),
        }),
        "meme" => Ok(ClassifiedResponse::Meme {
            image_link: raw
                .response
                .image_link
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| fallbacks.meme_image.clone()),
        }),
        other => Err(ClassifyError::UnrecognizedVariant(other.to_string())),
    }
}

fn parse_audio_analysis(reply: &str) -> Result<AudioAnalysis, ClassifyError> {
    let cleaned = strip_code_fences(reply);
    let mut analysis: AudioAnalysis = serde_json::from_str(&cleaned)
        .map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    analysis.depression_score = analysis.depression_score.clamp(0.0, 1.0);
    Ok(analysis)
}

/// Accept either a label→confidence map or a bare label string.
fn emotion_map_or_label<'de, D>(deserializer: D) -> Result<HashMap<String, f32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Map(HashMap<String, f32>),
        Label(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Map(m) => m,
        Raw::Label(label) => HashMap::from([(label, 1.0)]),
    })
}

/// Production classifier backed by the OpenAI client.
pub struct LlmClassifier {
    client: openai::Client,
    fallbacks: Fallbacks,
}

impl LlmClassifier {
    pub fn new(client: openai::Client, fallbacks: Fallbacks) -> Self {
        Self { client, fallbacks }
    }
}

impl Classify for LlmClassifier {
    async fn classify_text(&self, text: &str) -> Result<ClassifiedResponse, ClassifyError> {
        let reply = self
            .client
            .chat_json(&text_system_prompt(), text, 2048)
            .await
            .map_err(ClassifyError::Api)?;
        normalize(&reply, &self.fallbacks)
    }

    async fn analyze_voice(
        &self,
        wav_base64: &str,
        features: &FeatureVector,
    ) -> Result<AudioAnalysis, ClassifyError> {
        let context = format!("Acoustic features of the recording:\n{}", features.describe());
        let reply = self
            .client
            .chat_audio(AUDIO_SYSTEM_PROMPT, wav_base64, &context, 2048)
            .await
            .map_err(ClassifyError::Api)?;
        parse_audio_analysis(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallbacks() -> Fallbacks {
        Fallbacks {
            card_image: "https://example.com/card.png".to_string(),
            meme_image: "https://example.com/meme.gif".to_string(),
        }
    }

    #[test]
    fn test_parse_card_reply() {
        let reply = r#"{"answer_type": "card", "response": {"text": "The Star: hope returns.", "image_link": "https://cards/XVII.jpg"}}"#;
        let resp = normalize(reply, &fallbacks()).unwrap();
        assert_eq!(
            resp,
            ClassifiedResponse::Card {
                text: "The Star: hope returns.".to_string(),
                image_link: "https://cards/XVII.jpg".to_string(),
            }
        );
    }

    #[test]
    fn test_card_missing_image_uses_fallback() {
        let reply = r#"{"answer_type": "card", "response": {"text": "A reading."}}"#;
        match normalize(reply, &fallbacks()).unwrap() {
            ClassifiedResponse::Card { image_link, .. } => {
                assert_eq!(image_link, "https://example.com/card.png");
            }
            other => panic!("expected card, got {other:?}"),
        }
    }

    #[test]
    fn test_card_empty_text_gets_default() {
        let reply = r#"{"answer_type": "card", "response": {"text": "", "image_link": "https://c/I.jpg"}}"#;
        match normalize(reply, &fallbacks()).unwrap() {
            ClassifiedResponse::Card { text, .. } => assert!(!text.is_empty()),
            other => panic!("expected card, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_chitchat_and_meme() {
        let chat = normalize(
            r#"{"answer_type": "chit-chat", "response": {"text": "hi!"}}"#,
            &fallbacks(),
        )
        .unwrap();
        assert_eq!(chat, ClassifiedResponse::ChitChat { text: "hi!".to_string() });

        let meme = normalize(r#"{"answer_type": "meme", "response": {}}"#, &fallbacks()).unwrap();
        assert_eq!(
            meme,
            ClassifiedResponse::Meme { image_link: "https://example.com/meme.gif".to_string() }
        );
    }

    #[test]
    fn test_unknown_tag_is_unrecognized_variant() {
        let reply = r#"{"answer_type": "horoscope", "response": {"text": "??"}}"#;
        match normalize(reply, &fallbacks()) {
            Err(ClassifyError::UnrecognizedVariant(tag)) => assert_eq!(tag, "horoscope"),
            other => panic!("expected UnrecognizedVariant, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            normalize("not json at all", &fallbacks()),
            Err(ClassifyError::Malformed(_))
        ));
    }

    #[test]
    fn test_strips_code_fences() {
        let fenced = "```json\n{\"answer_type\": \"chit-chat\", \"response\": {\"text\": \"hey\"}}\n```";
        let resp = normalize(fenced, &fallbacks()).unwrap();
        assert_eq!(resp, ClassifiedResponse::ChitChat { text: "hey".to_string() });
    }

    #[test]
    fn test_parse_audio_analysis() {
        let reply = r#"{
            "transcription": "I feel tired lately",
            "emotion": {"sadness": 0.7, "neutral": 0.2},
            "depression_score": 0.4,
            "ai_response": "That sounds heavy. Want to talk about it?"
        }"#;
        let analysis = parse_audio_analysis(reply).unwrap();
        assert_eq!(analysis.transcription, "I feel tired lately");
        assert_eq!(analysis.emotion.get("sadness"), Some(&0.7));
        assert!((analysis.depression_score - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_audio_analysis_clamps_depression_score() {
        let reply = r#"{"transcription": "x", "emotion": {}, "depression_score": 3.5, "ai_response": "y"}"#;
        let analysis = parse_audio_analysis(reply).unwrap();
        assert!((analysis.depression_score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_audio_analysis_accepts_bare_emotion_label() {
        let reply = r#"{"transcription": "x", "emotion": "neutral", "depression_score": 0.1, "ai_response": "y"}"#;
        let analysis = parse_audio_analysis(reply).unwrap();
        assert_eq!(analysis.emotion.get("neutral"), Some(&1.0));
    }

    #[test]
    fn test_prompt_lists_all_major_arcana() {
        let prompt = text_system_prompt();
        assert_eq!(CARD_IMAGES.len(), 22);
        for (name, url) in CARD_IMAGES {
            assert!(prompt.contains(url), "missing {name}");
        }
    }
}
