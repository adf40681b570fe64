use crate::error::{Error, Result};
use crate::prompt::Family;
use serde::Serialize;
use std::collections::BTreeMap;

/// How an image model delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageEncoding {
    /// Raw PNG bytes in the response body.
    RawPng,
    /// JSON `{ "image": "<base64>" }` holding a JPEG.
    Base64Jpeg,
}

impl ImageEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::RawPng => "image/png",
            Self::Base64Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub key: String,
    pub provider_id: String,
    pub family: Family,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_encoding: Option<ImageEncoding>,
}

impl ModelSpec {
    fn new(key: &str, provider_id: &str, family: Family) -> Self {
        Self {
            key: key.into(),
            provider_id: provider_id.into(),
            family,
            image_encoding: None,
        }
    }

    fn image(key: &str, provider_id: &str, encoding: ImageEncoding) -> Self {
        Self {
            image_encoding: Some(encoding),
            ..Self::new(key, provider_id, Family::Other)
        }
    }
}

/// Models available for one kind of task, keyed by their short client key.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ModelTable {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelTable {
    pub fn new(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: specs.into_iter().map(|s| (s.key.clone(), s)).collect(),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<&ModelSpec> {
        self.models
            .get(key)
            .ok_or_else(|| Error::unknown_model(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Immutable model catalogue, built once at startup and handed to whoever needs it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRegistry {
    pub image: ModelTable,
    pub summary: ModelTable,
    pub text: ModelTable,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        use ImageEncoding::*;

        let image = ModelTable::new([
            ModelSpec::image("m1", "@cf/stabilityai/stable-diffusion-xl-base-1.0", RawPng),
            ModelSpec::image("m2", "@cf/bytedance/stable-diffusion-xl-lightning", RawPng),
            ModelSpec::image("m3", "@cf/lykon/dreamshaper-8-lcm", RawPng),
            ModelSpec::image("m4", "@cf/black-forest-labs/flux-1-schnell", Base64Jpeg),
        ]);

        let summary = ModelTable::new([ModelSpec::new(
            "m1",
            "@cf/facebook/bart-large-cnn",
            Family::Other,
        )]);

        let text = ModelTable::new([
            ModelSpec::new("m1", "@cf/meta-llama/llama-2-7b-chat-hf-lora", Family::Llama),
            ModelSpec::new("m2", "@cf/mistral/mistral-7b-instruct-v0.2-lora", Family::Mistral),
            ModelSpec::new("m3", "@cf/openchat/openchat-3.5-0106", Family::OpenChat),
            ModelSpec::new("m4", "@hf/thebloke/neural-chat-7b-v3-1-awq", Family::NeuralChat),
            ModelSpec::new("m5", "@cf/fblgit/una-cybertron-7b-v2-bf16", Family::Other),
            ModelSpec::new("m6", "@cf/tinyllama/tinyllama-1.1b-chat-v1.0", Family::Other),
            ModelSpec::new("m7", "@hf/nexusflow/starling-lm-7b-beta", Family::Starling),
        ]);

        Self {
            image,
            summary,
            text,
        }
    }
}
