//! Conversation dispatcher.
//!
//! Routes each user turn through the daily-reveal gate and the classifier,
//! renders the typed response into message side-effects, and updates the
//! gate. All classifier failures end the turn with a single user-visible
//! message; nothing here is allowed to kill the conversation loop.

use base64::Engine as _;
use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::audio::{extract_features, transcode_voice};
use crate::classifier::{AudioAnalysis, ClassifiedResponse, Classify, ClassifyError};
use crate::config::CardMedia;
use crate::gate::{RevealGate, SessionStore};

pub const REFLECTION_PROMPT: &str =
    "🎴 Share your thoughts before I reveal your tarot card!";
pub const ALREADY_REVEALED: &str =
    "🎴 You've already received a card today! Feel free to chat.";
pub const CARD_INTRO: &str = "✨ Here's your card of the day!";
pub const CARD_READING_PREFIX: &str = "✨ Here's the prediction of the day";
pub const MEME_CAPTION: &str = "Here's something fun for you! 😆";
pub const CLARIFICATION: &str = "I'm not sure how to respond. Can you rephrase?";
pub const CLASSIFIER_APOLOGY: &str =
    "An error occurred while processing your input. Please try again.";
pub const AUDIO_ERROR: &str = "⚠️ Error processing audio. Please try again.";

/// Default substituted for acoustic features that fail to extract.
const FEATURE_DEFAULT: f64 = 0.0;

/// Message side-effects, implemented by the Telegram adapter and mocked in
/// tests. Media is sent by URL; the asset itself is hosted externally.
#[allow(async_fn_in_trait)]
pub trait Outbox {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String>;
    async fn send_photo(
        &self,
        user_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), String>;
    async fn send_animation(&self, user_id: i64, url: &str) -> Result<(), String>;
}

pub struct Dispatcher<C, O> {
    classifier: C,
    outbox: O,
    sessions: SessionStore,
    /// Reveal-day reference zone; None means host-local.
    timezone: Option<Tz>,
    card_media: CardMedia,
}

impl<C: Classify, O: Outbox> Dispatcher<C, O> {
    pub fn new(classifier: C, outbox: O, timezone: Option<Tz>, card_media: CardMedia) -> Self {
        Self {
            classifier,
            outbox,
            sessions: SessionStore::new(),
            timezone,
            card_media,
        }
    }

    /// The civil date used for reveal gating.
    fn today(&self) -> NaiveDate {
        match self.timezone {
            Some(tz) => chrono::Utc::now().with_timezone(&tz).date_naive(),
            None => chrono::Local::now().date_naive(),
        }
    }

    /// `/card` command: deflect a repeat request or prompt for reflection.
    pub async fn handle_card_command(&self, user_id: i64) {
        match self.sessions.begin_reveal(user_id, self.today()).await {
            RevealGate::AlreadyRevealed => {
                info!("user {user_id}: repeat card request deflected");
                let _ = self.outbox.send_text(user_id, ALREADY_REVEALED).await;
            }
            RevealGate::Prompted => {
                let _ = self.outbox.send_text(user_id, REFLECTION_PROMPT).await;
            }
        }
    }

    /// Free-text turn: clear the gate's awaiting flag, classify, render.
    pub async fn handle_text(&self, user_id: i64, text: &str) {
        let was_awaiting = self.sessions.take_awaiting(user_id).await;
        if was_awaiting {
            info!("user {user_id}: reflective input received");
        }

        match self.classifier.classify_text(text).await {
            Ok(response) => self.render(user_id, response).await,
            Err(ClassifyError::UnrecognizedVariant(tag)) => {
                warn!("user {user_id}: unrecognized answer_type '{tag}'");
                let _ = self.outbox.send_text(user_id, CLARIFICATION).await;
            }
            Err(e) => {
                warn!("user {user_id}: classification failed: {e}");
                let _ = self.outbox.send_text(user_id, CLASSIFIER_APOLOGY).await;
            }
        }
    }

    async fn render(&self, user_id: i64, response: ClassifiedResponse) {
        match response {
            ClassifiedResponse::ChitChat { text } => {
                let _ = self.outbox.send_text(user_id, &text).await;
            }
            ClassifiedResponse::Card { text, image_link } => {
                // The classifier is never trusted to re-grant a card: the
                // reveal is committed atomically before any rendering, and a
                // same-day duplicate downgrades to chit-chat.
                if !self.sessions.try_commit_reveal(user_id, self.today()).await {
                    info!("user {user_id}: same-day card result downgraded to chit-chat");
                    let _ = self.outbox.send_text(user_id, &text).await;
                    return;
                }

                info!("user {user_id}: revealing card {image_link}");
                let _ = self.outbox.send_text(user_id, CARD_INTRO).await;
                let media = match self.card_media {
                    CardMedia::Photo => self.outbox.send_photo(user_id, &image_link, None).await,
                    CardMedia::Animation => self.outbox.send_animation(user_id, &image_link).await,
                };
                if let Err(e) = media {
                    warn!("user {user_id}: failed to send card media: {e}");
                }
                let reading = format!("{CARD_READING_PREFIX}\n\n{text}");
                let _ = self.outbox.send_text(user_id, &reading).await;
            }
            ClassifiedResponse::Meme { image_link } => {
                let result = if is_animated(&image_link) {
                    self.outbox.send_animation(user_id, &image_link).await
                } else {
                    self.outbox
                        .send_photo(user_id, &image_link, Some(MEME_CAPTION))
                        .await
                };
                if let Err(e) = result {
                    warn!("user {user_id}: failed to send meme: {e}");
                }
            }
        }
    }

    /// Voice turn: transcode, extract features, submit to the audio model.
    /// Never mutates the reveal gate.
    pub async fn handle_voice(&self, user_id: i64, label: String, ogg_data: Vec<u8>) {
        let prepared = tokio::task::spawn_blocking(move || {
            let decoded = transcode_voice(&ogg_data).map_err(|e| e.to_string())?;
            let features =
                extract_features(&label, &decoded.samples, decoded.sample_rate, FEATURE_DEFAULT)
                    .map_err(|e| format!("{label}: {e}"))?;
            Ok::<_, String>((decoded.wav, features))
        })
        .await;

        let (wav, features) = match prepared {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("user {user_id}: voice processing failed: {e}");
                let _ = self.outbox.send_text(user_id, AUDIO_ERROR).await;
                return;
            }
            Err(e) => {
                warn!("user {user_id}: voice task panicked: {e}");
                let _ = self.outbox.send_text(user_id, AUDIO_ERROR).await;
                return;
            }
        };

        let wav_base64 = base64::engine::general_purpose::STANDARD.encode(&wav);

        match self.classifier.analyze_voice(&wav_base64, &features).await {
            Ok(analysis) => {
                let _ = self
                    .outbox
                    .send_text(user_id, &format_analysis(&analysis))
                    .await;
            }
            Err(e) => {
                warn!("user {user_id}: voice analysis failed: {e}");
                let _ = self.outbox.send_text(user_id, AUDIO_ERROR).await;
            }
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

fn is_animated(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.to_ascii_lowercase();
    path.ends_with(".gif") || path.ends_with(".mp4")
}

fn format_analysis(analysis: &AudioAnalysis) -> String {
    let mut emotions: Vec<(&String, &f32)> = analysis.emotion.iter().collect();
    emotions.sort_by(|a, b| b.1.total_cmp(a.1));
    let emotion_line = if emotions.is_empty() {
        "unknown".to_string()
    } else {
        emotions
            .iter()
            .map(|(label, score)| format!("{label} {score:.2}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "🎙 Transcription: {}\n😶 Emotions: {}\n📉 Depression score: {:.2}\n🤖 {}",
        if analysis.transcription.is_empty() {
            "I couldn't understand that."
        } else {
            analysis.transcription.as_str()
        },
        emotion_line,
        analysis.depression_score,
        if analysis.ai_response.is_empty() {
            "Let's talk!"
        } else {
            analysis.ai_response.as_str()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Recorded outbox side-effects.
    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(String),
        Photo { url: String, caption: Option<String> },
        Animation(String),
    }

    #[derive(Default)]
    struct MockOutbox {
        sent: Mutex<Vec<Sent>>,
    }

    impl MockOutbox {
        fn drain(&self) -> Vec<Sent> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl Outbox for &MockOutbox {
        async fn send_text(&self, _user_id: i64, text: &str) -> Result<(), String> {
            self.sent.lock().unwrap().push(Sent::Text(text.to_string()));
            Ok(())
        }

        async fn send_photo(
            &self,
            _user_id: i64,
            url: &str,
            caption: Option<&str>,
        ) -> Result<(), String> {
            self.sent.lock().unwrap().push(Sent::Photo {
                url: url.to_string(),
                caption: caption.map(str::to_string),
            });
            Ok(())
        }

        async fn send_animation(&self, _user_id: i64, url: &str) -> Result<(), String> {
            self.sent.lock().unwrap().push(Sent::Animation(url.to_string()));
            Ok(())
        }
    }

    /// Scripted classifier: returns canned results in order.
    struct MockClassifier {
        script: Mutex<Vec<Result<ClassifiedResponse, ClassifyError>>>,
    }

    impl MockClassifier {
        fn new(script: Vec<Result<ClassifiedResponse, ClassifyError>>) -> Self {
            Self { script: Mutex::new(script) }
        }
    }

    impl Classify for MockClassifier {
        async fn classify_text(
            &self,
            _text: &str,
        ) -> Result<ClassifiedResponse, ClassifyError> {
            self.script
                .lock()
                .unwrap()
                .remove(0)
        }

        async fn analyze_voice(
            &self,
            _wav_base64: &str,
            _features: &crate::audio::FeatureVector,
        ) -> Result<AudioAnalysis, ClassifyError> {
            Ok(AudioAnalysis {
                transcription: "hello".to_string(),
                emotion: HashMap::from([("neutral".to_string(), 0.9)]),
                depression_score: 0.1,
                ai_response: "hi there".to_string(),
            })
        }
    }

    fn card(text: &str, link: &str) -> Result<ClassifiedResponse, ClassifyError> {
        Ok(ClassifiedResponse::Card {
            text: text.to_string(),
            image_link: link.to_string(),
        })
    }

    fn dispatcher<'a>(
        outbox: &'a MockOutbox,
        script: Vec<Result<ClassifiedResponse, ClassifyError>>,
    ) -> Dispatcher<MockClassifier, &'a MockOutbox> {
        Dispatcher::new(MockClassifier::new(script), outbox, None, CardMedia::Photo)
    }

    const USER: i64 = 42;

    #[tokio::test]
    async fn test_card_happy_path() {
        let outbox = MockOutbox::default();
        let d = dispatcher(&outbox, vec![card("Hope returns.", "https://cards/III.jpg")]);

        // /card with no prior reveal: reflection prompt, gate armed.
        d.handle_card_command(USER).await;
        assert_eq!(outbox.drain(), vec![Sent::Text(REFLECTION_PROMPT.to_string())]);
        assert!(d.sessions().snapshot(USER).await.awaiting_thoughts);

        // Reflective reply produces the three-message card sequence.
        d.handle_text(USER, "I feel hopeful").await;
        let sent = outbox.drain();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Sent::Text(CARD_INTRO.to_string()));
        assert_eq!(
            sent[1],
            Sent::Photo { url: "https://cards/III.jpg".to_string(), caption: None }
        );
        match &sent[2] {
            Sent::Text(t) => assert!(t.contains("Hope returns.")),
            other => panic!("expected reading text, got {other:?}"),
        }

        let session = d.sessions().snapshot(USER).await;
        assert!(!session.awaiting_thoughts);
        assert!(session.last_reveal_date.is_some());

        // Same-day /card is deflected without a classifier call (the script
        // is empty, so a call would panic).
        d.handle_card_command(USER).await;
        assert_eq!(outbox.drain(), vec![Sent::Text(ALREADY_REVEALED.to_string())]);
    }

    #[tokio::test]
    async fn test_second_card_same_day_downgrades_to_chitchat() {
        let outbox = MockOutbox::default();
        let d = dispatcher(
            &outbox,
            vec![
                card("First reading.", "https://cards/I.jpg"),
                card("Second reading.", "https://cards/II.jpg"),
            ],
        );

        d.handle_text(USER, "feeling great").await;
        assert_eq!(outbox.drain().len(), 3);

        // The classifier tries to grant another card the same day; the gate
        // overrides it to a plain text reply.
        d.handle_text(USER, "still feeling great").await;
        assert_eq!(outbox.drain(), vec![Sent::Text("Second reading.".to_string())]);
    }

    #[tokio::test]
    async fn test_gate_resets_on_any_text_turn() {
        let outbox = MockOutbox::default();
        let d = dispatcher(
            &outbox,
            vec![Ok(ClassifiedResponse::ChitChat { text: "sure!".to_string() })],
        );

        d.handle_card_command(USER).await;
        assert!(d.sessions().snapshot(USER).await.awaiting_thoughts);

        // Chit-chat outcome still clears the flag.
        d.handle_text(USER, "just saying hi").await;
        assert!(!d.sessions().snapshot(USER).await.awaiting_thoughts);
    }

    #[tokio::test]
    async fn test_unrecognized_variant_renders_clarification() {
        let outbox = MockOutbox::default();
        let d = dispatcher(
            &outbox,
            vec![Err(ClassifyError::UnrecognizedVariant("horoscope".to_string()))],
        );

        d.handle_text(USER, "???").await;
        assert_eq!(outbox.drain(), vec![Sent::Text(CLARIFICATION.to_string())]);

        let session = d.sessions().snapshot(USER).await;
        assert!(session.last_reveal_date.is_none());
        assert!(!session.awaiting_thoughts);
    }

    #[tokio::test]
    async fn test_classifier_error_is_contained() {
        let outbox = MockOutbox::default();
        let d = dispatcher(
            &outbox,
            vec![Err(ClassifyError::Api(crate::openai::Error::Http(
                "timeout".to_string(),
            )))],
        );

        let before = d.sessions().snapshot(USER).await;
        d.handle_text(USER, "hello?").await;

        // Exactly one user-visible message, session unchanged.
        assert_eq!(outbox.drain(), vec![Sent::Text(CLASSIFIER_APOLOGY.to_string())]);
        assert_eq!(d.sessions().snapshot(USER).await, before);
    }

    #[tokio::test]
    async fn test_meme_rendering_by_extension() {
        let outbox = MockOutbox::default();
        let d = dispatcher(
            &outbox,
            vec![
                Ok(ClassifiedResponse::Meme {
                    image_link: "https://memes/funny.gif".to_string(),
                }),
                Ok(ClassifiedResponse::Meme {
                    image_link: "https://memes/funny.jpg".to_string(),
                }),
            ],
        );

        d.handle_text(USER, "haha").await;
        assert_eq!(
            outbox.drain(),
            vec![Sent::Animation("https://memes/funny.gif".to_string())]
        );

        d.handle_text(USER, "haha again").await;
        assert_eq!(
            outbox.drain(),
            vec![Sent::Photo {
                url: "https://memes/funny.jpg".to_string(),
                caption: Some(MEME_CAPTION.to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_card_animation_mode() {
        let outbox = MockOutbox::default();
        let d = Dispatcher::new(
            MockClassifier::new(vec![card("Reading.", "https://cards/X.jpg")]),
            &outbox,
            None,
            CardMedia::Animation,
        );

        d.handle_text(USER, "excited").await;
        let sent = outbox.drain();
        assert_eq!(sent[1], Sent::Animation("https://cards/X.jpg".to_string()));
    }

    #[tokio::test]
    async fn test_voice_turn_does_not_touch_gate() {
        let outbox = MockOutbox::default();
        let d = dispatcher(&outbox, vec![]);

        // Invalid OGG bytes: ffmpeg fails, one audio error message.
        d.handle_voice(USER, "note.oga".to_string(), vec![0u8; 16]).await;
        assert_eq!(outbox.drain(), vec![Sent::Text(AUDIO_ERROR.to_string())]);

        let session = d.sessions().snapshot(USER).await;
        assert!(session.last_reveal_date.is_none());
        assert!(!session.awaiting_thoughts);
    }

    #[test]
    fn test_is_animated() {
        assert!(is_animated("https://x/a.gif"));
        assert!(is_animated("https://x/a.MP4"));
        assert!(is_animated("https://x/a.gif?cid=abc&rid=def"));
        assert!(!is_animated("https://x/a.jpg"));
        assert!(!is_animated("https://x/a.png#frag"));
    }

    #[test]
    fn test_format_analysis_sorts_emotions() {
        let analysis = AudioAnalysis {
            transcription: "I'm okay".to_string(),
            emotion: HashMap::from([
                ("neutral".to_string(), 0.3),
                ("happiness".to_string(), 0.6),
            ]),
            depression_score: 0.12,
            ai_response: "Glad to hear it!".to_string(),
        };

        let text = format_analysis(&analysis);
        assert!(text.contains("I'm okay"));
        assert!(text.contains("0.12"));
        let happiness = text.find("happiness").unwrap();
        let neutral = text.find("neutral").unwrap();
        assert!(happiness < neutral, "emotions not sorted by confidence");
    }

    #[test]
    fn test_format_analysis_defaults_for_empty_fields() {
        let analysis = AudioAnalysis {
            transcription: String::new(),
            emotion: HashMap::new(),
            depression_score: 0.0,
            ai_response: String::new(),
        };

        let text = format_analysis(&analysis);
        assert!(text.contains("I couldn't understand that."));
        assert!(text.contains("unknown"));
        assert!(text.contains("Let's talk!"));
    }
}
