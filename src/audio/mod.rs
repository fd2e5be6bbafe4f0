//! Voice-message pipeline: ffmpeg transcoding and acoustic feature
//! extraction feeding the audio LLM endpoint.

pub mod features;
pub mod transcode;

pub use features::{FeatureVector, extract_features};
pub use transcode::{DecodedVoice, TranscodeError, transcode_voice};
