use serde::{Deserialize, Serialize};
use std::fmt;

use grail_types::{GrailError, Result};

// ---------------------------------------------------------------------------
// ModelRole / ModelTier
// ---------------------------------------------------------------------------

/// Functional category of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Text,
    Image,
}

/// Coarse quality/speed selector, independent of a model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Best,
    Fast,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelRole::Text => "text",
            ModelRole::Image => "image",
        })
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelTier::Best => "best",
            ModelTier::Fast => "fast",
        })
    }
}

impl std::str::FromStr for ModelTier {
    type Err = GrailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "best" => Ok(ModelTier::Best),
            "fast" => Ok(ModelTier::Fast),
            other => Err(GrailError::invalid_argument(format!(
                "unknown model tier '{other}' (expected best or fast)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub text_generation: bool,
    pub image_generation: bool,
    pub image_understanding: bool,
    pub pdf_understanding: bool,
    pub json_output: bool,
}

impl ModelCapabilities {
    /// Multimodal language model: text, image and PDF in, text or JSON out.
    pub const fn language() -> Self {
        Self {
            text_generation: true,
            image_generation: false,
            image_understanding: true,
            pdf_understanding: true,
            json_output: true,
        }
    }

    pub const fn image_generation() -> Self {
        Self {
            text_generation: false,
            image_generation: true,
            image_understanding: true,
            pdf_understanding: false,
            json_output: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub role: ModelRole,
    /// `None` for models listed in the catalog but not bound to a tier.
    pub tier: Option<ModelTier>,
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ModelInfo {
    pub fn new(
        name: impl Into<String>,
        role: ModelRole,
        tier: Option<ModelTier>,
        capabilities: ModelCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            tier,
            capabilities,
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// ModelCatalog
// ---------------------------------------------------------------------------

/// Static per-provider catalog: one model per (role, tier) slot plus any
/// number of untiered extras. Listing order is best text, fast text, best
/// image, fast image, then extras.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    best_text: Option<ModelInfo>,
    fast_text: Option<ModelInfo>,
    best_image: Option<ModelInfo>,
    fast_image: Option<ModelInfo>,
    extras: Vec<ModelInfo>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `model` to the (role, tier) slot. The same model may fill both
    /// tiers of a role.
    pub fn with_tier(mut self, role: ModelRole, tier: ModelTier, model: ModelInfo) -> Self {
        let model = ModelInfo {
            role,
            tier: Some(tier),
            ..model
        };
        *self.slot_mut(role, tier) = Some(model);
        self
    }

    /// Add a model reachable only through listing, not tier resolution.
    pub fn with_extra(mut self, model: ModelInfo) -> Self {
        self.extras.push(model);
        self
    }

    fn slot_mut(&mut self, role: ModelRole, tier: ModelTier) -> &mut Option<ModelInfo> {
        match (role, tier) {
            (ModelRole::Text, ModelTier::Best) => &mut self.best_text,
            (ModelRole::Text, ModelTier::Fast) => &mut self.fast_text,
            (ModelRole::Image, ModelTier::Best) => &mut self.best_image,
            (ModelRole::Image, ModelTier::Fast) => &mut self.fast_image,
        }
    }

    pub fn get(&self, role: ModelRole, tier: ModelTier) -> Option<&ModelInfo> {
        match (role, tier) {
            (ModelRole::Text, ModelTier::Best) => self.best_text.as_ref(),
            (ModelRole::Text, ModelTier::Fast) => self.fast_text.as_ref(),
            (ModelRole::Image, ModelTier::Best) => self.best_image.as_ref(),
            (ModelRole::Image, ModelTier::Fast) => self.fast_image.as_ref(),
        }
    }

    /// Name of the model in the (role, tier) slot.
    pub fn resolve(&self, role: ModelRole, tier: ModelTier) -> Result<String> {
        self.get(role, tier).map(|m| m.name.clone()).ok_or_else(|| {
            GrailError::invalid_argument(format!("no {role} model with tier {tier}"))
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&ModelInfo> {
        self.all().find(|m| m.name == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &ModelInfo> {
        [
            &self.best_text,
            &self.fast_text,
            &self.best_image,
            &self.fast_image,
        ]
        .into_iter()
        .flatten()
        .chain(self.extras.iter())
    }

    pub fn to_vec(&self) -> Vec<ModelInfo> {
        self.all().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.all().next().is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
