// Pricing templates (pricing.json)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tools::ToolId;

/// Per-model price card, USD (or `currency`) per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub provider: String,
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    pub cache_write_per_1m: f64,
    pub cache_read_per_1m: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl ModelPrice {
    pub fn scaled(&self, multiplier: f64) -> Self {
        Self {
            input_per_1m: self.input_per_1m * multiplier,
            output_per_1m: self.output_per_1m * multiplier,
            cache_write_per_1m: self.cache_write_per_1m * multiplier,
            cache_read_per_1m: self.cache_read_per_1m * multiplier,
            ..self.clone()
        }
    }
}

/// A model inherited from another template with a price multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritedModel {
    pub model_name: String,
    pub source_template_id: String,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_default_preset: bool,
    #[serde(default)]
    pub inherited_models: Vec<InheritedModel>,
    #[serde(default)]
    pub custom_models: HashMap<String, ModelPrice>,
}

/// pricing.json top level: templates plus the per-tool default template id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingStore {
    #[serde(default)]
    pub templates: HashMap<String, PricingTemplate>,
    #[serde(default)]
    pub tool_defaults: HashMap<ToolId, String>,
}
