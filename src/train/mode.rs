//! Which modules a run trains.
//!
//! | module        | gpt | speaker | encoder | decoder |
//! |---------------|-----|---------|---------|---------|
//! | `gpt_speaker` |  ✓  |    ✓    |         |         |
//! | `gpt`         |  ✓  |         |         |         |
//! | `speaker`     |     |    ✓    |         |         |
//! | `autoencoder` |     |         |    ✓    |    ✓    |
//! | `encoder`     |     |         |    ✓    |         |
//! | `decoder`     |     |         |         |    ✓    |
//!
//! Modules outside the plan are kept out of the optimizer, and the outputs of
//! frozen upstream encoders are detached before use.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum TrainModule {
    GptSpeaker,
    Gpt,
    Speaker,
    Autoencoder,
    Encoder,
    Decoder,
}

/// Codec pair targeted by the autoencoder modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DecoderType {
    /// GPT hidden states → mel.
    Decoder,
    /// Quantized audio features → mel.
    Dvae,
}

/// Training stage a module belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// GPT and/or speaker embeddings against quantized audio ids.
    Sequence,
    /// Codec encoder and/or decoder against mel reconstruction.
    Autoencoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainPlan {
    pub gpt: bool,
    pub speaker: bool,
    pub encoder: bool,
    pub decoder: bool,
}

impl TrainModule {
    pub const fn plan(self) -> TrainPlan {
        let (gpt, speaker, encoder, decoder) = match self {
            TrainModule::GptSpeaker => (true, true, false, false),
            TrainModule::Gpt => (true, false, false, false),
            TrainModule::Speaker => (false, true, false, false),
            TrainModule::Autoencoder => (false, false, true, true),
            TrainModule::Encoder => (false, false, true, false),
            TrainModule::Decoder => (false, false, false, true),
        };
        TrainPlan {
            gpt,
            speaker,
            encoder,
            decoder,
        }
    }

    pub const fn stage(self) -> Stage {
        match self {
            TrainModule::GptSpeaker | TrainModule::Gpt | TrainModule::Speaker => Stage::Sequence,
            TrainModule::Autoencoder | TrainModule::Encoder | TrainModule::Decoder => {
                Stage::Autoencoder
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrainModule::GptSpeaker => "gpt_speaker",
            TrainModule::Gpt => "gpt",
            TrainModule::Speaker => "speaker",
            TrainModule::Autoencoder => "autoencoder",
            TrainModule::Encoder => "encoder",
            TrainModule::Decoder => "decoder",
        }
    }
}

impl fmt::Display for TrainModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DecoderType {
    /// File-name prefix of this codec pair (`decoder_encoder`, `dvae_decoder`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            DecoderType::Decoder => "decoder",
            DecoderType::Dvae => "dvae",
        }
    }
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn plans_are_disjoint_per_stage() {
        for module in TrainModule::value_variants() {
            let plan = module.plan();
            let sequence = plan.gpt || plan.speaker;
            let codec = plan.encoder || plan.decoder;
            assert!(sequence ^ codec, "{module} mixes stages");
            assert_eq!(module.stage() == Stage::Sequence, sequence);
        }
        assert_eq!(
            TrainModule::GptSpeaker.plan(),
            TrainPlan {
                gpt: true,
                speaker: true,
                encoder: false,
                decoder: false
            }
        );
    }

    #[test]
    fn cli_names() {
        assert_eq!(
            TrainModule::from_str("gpt_speaker", false).unwrap(),
            TrainModule::GptSpeaker
        );
        assert_eq!(DecoderType::from_str("dvae", false).unwrap(), DecoderType::Dvae);
        assert_eq!(TrainModule::Autoencoder.to_string(), "autoencoder");
        let json = serde_json::to_string(&TrainModule::GptSpeaker).unwrap();
        assert_eq!(json, "\"gpt_speaker\"");
    }
}
