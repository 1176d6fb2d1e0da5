//! Code for loading and running the pretrained TrOCR handwriting model

use crate::config::ModelSettings;
use crate::hub::Hub;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{trocr, vit};
use image::RgbImage;
use serde::Deserialize;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

pub mod generate;
pub mod preprocess;

pub use generate::SpecialTokens;
pub use preprocess::ProcessorConfig;

/// Anything that can read the text in an image. Implementations must be safe
/// to share between request handlers.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, image: &RgbImage) -> Result<String>;
}

/// `config.json` of a vision-encoder-decoder model
#[derive(Debug, Clone, Deserialize)]
struct EncoderDecoderConfig {
    encoder: vit::Config,
    decoder: trocr::TrOCRConfig,
}

/// Local paths of everything needed to build a [`ModelSession`]
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub processor: PathBuf,
    pub tokenizer: PathBuf,
}

impl Artifacts {
    /// Fetch (or find in the cache) the artifacts of the configured model
    pub async fn fetch(settings: &ModelSettings) -> Result<Self> {
        let hub = Hub::new(&settings.hub_url, &settings.cache_dir)?;
        let (name, revision) = (settings.name.as_str(), settings.revision.as_str());

        Ok(Artifacts {
            config: hub.fetch(name, revision, "config.json").await?,
            weights: hub.fetch(name, revision, "model.safetensors").await?,
            processor: hub.fetch(name, revision, "preprocessor_config.json").await?,
            tokenizer: hub
                .fetch(
                    &settings.tokenizer_repo,
                    &settings.tokenizer_revision,
                    "tokenizer.json",
                )
                .await?,
        })
    }
}

/// Pick the accelerator if there is one, falling back to the CPU
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

/// The loaded model with its preprocessing and decoding configuration.
/// Built once at startup and never replaced.
pub struct ModelSession {
    /// The decoder keeps a key/value cache, so generation needs exclusive
    /// access. This also keeps a single device from running two requests.
    model: Mutex<trocr::TrOCRModel>,
    processor: ProcessorConfig,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    max_length: usize,
    device: Device,
}

impl Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ModelSession {{ model: <weights>, device: {:?}, tokens: {:?}, max_length: {} }}",
            self.device, self.tokens, self.max_length
        )
    }
}

impl ModelSession {
    /// Fetch the configured model and load it
    pub async fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let artifacts = Artifacts::fetch(settings).await?;
        let device = select_device(settings.force_cpu)?;
        Self::load(&artifacts, device, settings.max_length())
    }

    /// Load a session from local artifacts onto `device`
    #[tracing::instrument(skip(device))]
    pub fn load(artifacts: &Artifacts, device: Device, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
            .map_err(|e| anyhow!("failed to initialize tokenizer: {e}"))?;

        let processor = ProcessorConfig::from_file(&artifacts.processor)?;

        let file = std::fs::File::open(&artifacts.config)
            .with_context(|| format!("failed to open {:?}", artifacts.config))?;
        let config: EncoderDecoderConfig =
            serde_json::from_reader(file).context("failed to parse model config")?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&artifacts.weights], DType::F32, &device)?
        };

        Self::build(config, vb, processor, tokenizer, device, max_length)
    }

    /// Assemble a session from an already opened weight source
    fn build(
        config: EncoderDecoderConfig,
        vb: VarBuilder,
        processor: ProcessorConfig,
        tokenizer: Tokenizer,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;
        let EncoderDecoderConfig {
            encoder,
            mut decoder,
        } = config;

        // Decoding boundaries come from the tokenizer, not the artifact
        decoder.decoder_start_token_id = tokens.decoder_start as _;
        decoder.pad_token_id = tokens.pad as _;
        decoder.eos_token_id = tokens.eos as _;

        let model = trocr::TrOCRModel::new(&encoder, &decoder, vb)
            .context("failed to build model from weights")?;

        info!("loaded model on {device:?} with special tokens {tokens:?}");

        Ok(ModelSession {
            model: Mutex::new(model),
            processor,
            tokenizer,
            tokens,
            max_length,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.tokens
    }

    /// Run the encoder once and decode greedily against its output
    fn generate(&self, pixel_values: &Tensor) -> Result<Vec<u32>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        model.reset_kv_cache();

        let encoder_xs = model.encoder().forward(pixel_values)?;
        generate::greedy_decode(&self.tokens, self.max_length, |input, start_pos| {
            let input_ids = Tensor::new(input, &self.device)?.unsqueeze(0)?;
            Ok(model.decode(&input_ids, &encoder_xs, start_pos)?)
        })
    }
}

impl Transcriber for ModelSession {
    #[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
    fn transcribe(&self, image: &RgbImage) -> Result<String> {
        let pixel_values = self.processor.preprocess(image, &self.device)?;
        let ids = self.generate(&pixel_values)?;
        debug!("generated {} tokens", ids.len());
        generate::decode_text(&self.tokenizer, &self.tokens, &ids)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use super::preprocess::Size;

    #[test]
    fn test_force_cpu() {
        assert!(select_device(true).unwrap().is_cpu());
    }

    #[test]
    fn test_parse_encoder_decoder_config() {
        let json = r#"{
            "architectures": ["VisionEncoderDecoderModel"],
            "decoder": {
                "activation_dropout": 0.0,
                "activation_function": "gelu",
                "add_cross_attention": true,
                "attention_dropout": 0.0,
                "bos_token_id": 0,
                "classifier_dropout": 0.0,
                "cross_attention_hidden_size": 768,
                "d_model": 1024,
                "decoder_attention_heads": 16,
                "decoder_ffn_dim": 4096,
                "decoder_layerdrop": 0.0,
                "decoder_layers": 12,
                "decoder_start_token_id": 2,
                "dropout": 0.1,
                "eos_token_id": 2,
                "init_std": 0.02,
                "is_decoder": true,
                "layernorm_embedding": true,
                "max_position_embeddings": 512,
                "model_type": "trocr",
                "pad_token_id": 1,
                "scale_embedding": false,
                "tie_word_embeddings": false,
                "use_cache": false,
                "use_learned_position_embeddings": true,
                "vocab_size": 50265
            },
            "encoder": {
                "attention_probs_dropout_prob": 0.0,
                "hidden_act": "gelu",
                "hidden_dropout_prob": 0.0,
                "hidden_size": 768,
                "image_size": 384,
                "initializer_range": 0.02,
                "intermediate_size": 3072,
                "layer_norm_eps": 1e-12,
                "model_type": "vit",
                "num_attention_heads": 12,
                "num_channels": 3,
                "num_hidden_layers": 12,
                "patch_size": 16,
                "qkv_bias": false
            },
            "model_type": "vision-encoder-decoder",
            "tie_word_embeddings": false
        }"#;

        let config: EncoderDecoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.decoder.vocab_size, 50265);
        assert_eq!(config.decoder.eos_token_id, 2);
        assert_eq!(config.encoder.image_size, 384);
    }

    /// A randomly initialized model small enough to run in a unit test
    fn tiny_session(max_length: usize) -> ModelSession {
        let json = r#"{
            "encoder": {
                "hidden_size": 16,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 32,
                "hidden_act": "gelu",
                "layer_norm_eps": 1e-12,
                "image_size": 32,
                "patch_size": 16,
                "num_channels": 3,
                "qkv_bias": false
            },
            "decoder": {
                "vocab_size": 6,
                "d_model": 16,
                "cross_attention_hidden_size": 16,
                "decoder_layers": 1,
                "decoder_attention_heads": 2,
                "decoder_ffn_dim": 32,
                "activation_function": "gelu",
                "max_position_embeddings": 128,
                "dropout": 0.0,
                "attention_dropout": 0.0,
                "activation_dropout": 0.0,
                "decoder_start_token_id": 5,
                "init_std": 0.02,
                "decoder_layerdrop": 0.0,
                "use_cache": true,
                "scale_embedding": false,
                "pad_token_id": 5,
                "bos_token_id": 0,
                "eos_token_id": 5,
                "use_learned_position_embeddings": true,
                "tie_word_embeddings": false
            }
        }"#;
        let config: EncoderDecoderConfig = serde_json::from_str(json).unwrap();
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let processor = ProcessorConfig {
            size: Size::Square(32),
            ..Default::default()
        };

        ModelSession::build(
            config,
            vb,
            processor,
            fixtures::tokenizer(),
            Device::Cpu,
            max_length,
        )
        .unwrap()
    }

    #[test]
    fn test_special_tokens_override_artifact() {
        let session = tiny_session(64);
        assert_eq!(
            session.special_tokens(),
            SpecialTokens {
                decoder_start: 0,
                pad: 1,
                eos: 2
            }
        );
    }

    #[test]
    fn test_transcribe_is_repeatable() {
        let session = tiny_session(64);
        let image = RgbImage::from_fn(50, 20, |x, y| image::Rgb([(x * 5) as u8, (y * 12) as u8, 128]));

        // The key/value cache from the first call must not leak into the second
        let first = session.transcribe(&image).unwrap();
        let second = session.transcribe(&image).unwrap();
        assert_eq!(first, second);

        let pixel_values = session.processor.preprocess(&image, session.device()).unwrap();
        let ids = session.generate(&pixel_values).unwrap();
        assert!(ids.len() <= 64);
        assert_eq!(ids[0], session.special_tokens().decoder_start);
        assert_eq!(ids, session.generate(&pixel_values).unwrap());
    }

    #[test]
    fn test_transcribe_respects_max_length() {
        let session = tiny_session(4);
        let image = RgbImage::from_pixel(40, 40, image::Rgb([255, 255, 255]));
        let pixel_values = session.processor.preprocess(&image, session.device()).unwrap();
        let ids = session.generate(&pixel_values).unwrap();
        assert!(ids.len() <= 4);
        assert!(session.transcribe(&image).is_ok());
    }

    #[test]
    fn test_load_missing_artifacts() {
        let artifacts = Artifacts {
            config: "/nonexistent/config.json".into(),
            weights: "/nonexistent/model.safetensors".into(),
            processor: "/nonexistent/preprocessor_config.json".into(),
            tokenizer: "/nonexistent/tokenizer.json".into(),
        };
        let err = ModelSession::load(&artifacts, Device::Cpu, 64).unwrap_err();
        assert!(err.to_string().contains("tokenizer"));
    }
}
