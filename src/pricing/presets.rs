// Built-in preset pricing templates
//
// Public list prices per provider, last updated 2025-11. Presets are
// immutable: save/delete commands reject them and installation never
// overwrites a user-modified store entry with the same id.

use std::collections::HashMap;

use crate::models::{ModelPrice, PricingStore, PricingTemplate};
use crate::tools::{ToolId, ALL_TOOLS};

fn card(
    provider: &str,
    input: f64,
    output: f64,
    cache_write: f64,
    cache_read: f64,
    aliases: &[&str],
) -> ModelPrice {
    ModelPrice {
        provider: provider.to_string(),
        input_per_1m: input,
        output_per_1m: output,
        cache_write_per_1m: cache_write,
        cache_read_per_1m: cache_read,
        currency: "USD".to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
    }
}

fn preset_claude() -> PricingTemplate {
    let mut models = HashMap::new();
    models.insert(
        "claude-opus-4".to_string(),
        card("anthropic", 15.0, 75.0, 18.75, 1.5, &["opus"]),
    );
    models.insert(
        "claude-sonnet-4".to_string(),
        card("anthropic", 3.0, 15.0, 3.75, 0.3, &["sonnet"]),
    );
    models.insert(
        "claude-3-5-haiku".to_string(),
        card("anthropic", 1.0, 5.0, 1.25, 0.1, &["haiku"]),
    );
    PricingTemplate {
        id: "preset-claude".to_string(),
        name: "Anthropic (list prices)".to_string(),
        is_default_preset: true,
        inherited_models: vec![],
        custom_models: models,
    }
}

fn preset_codex() -> PricingTemplate {
    let mut models = HashMap::new();
    models.insert(
        "gpt-5".to_string(),
        card("openai", 1.25, 10.0, 0.0, 0.125, &[]),
    );
    models.insert(
        "gpt-5-codex".to_string(),
        card("openai", 1.25, 10.0, 0.0, 0.125, &["codex"]),
    );
    models.insert(
        "gpt-5-mini".to_string(),
        card("openai", 0.25, 2.0, 0.0, 0.025, &[]),
    );
    PricingTemplate {
        id: "preset-codex".to_string(),
        name: "OpenAI (list prices)".to_string(),
        is_default_preset: true,
        inherited_models: vec![],
        custom_models: models,
    }
}

fn preset_gemini() -> PricingTemplate {
    let mut models = HashMap::new();
    models.insert(
        "gemini-2.5-pro".to_string(),
        card("google", 1.25, 10.0, 0.0, 0.31, &[]),
    );
    models.insert(
        "gemini-2.5-flash".to_string(),
        card("google", 0.3, 2.5, 0.0, 0.075, &["flash"]),
    );
    PricingTemplate {
        id: "preset-gemini".to_string(),
        name: "Google (list prices)".to_string(),
        is_default_preset: true,
        inherited_models: vec![],
        custom_models: models,
    }
}

/// Seed the store with presets and per-tool defaults. Existing entries
/// (same id) and existing tool defaults are left untouched.
pub fn install_presets(store: &mut PricingStore) {
    for preset in [preset_claude(), preset_codex(), preset_gemini()] {
        store
            .templates
            .entry(preset.id.clone())
            .or_insert(preset);
    }
    for tool in ALL_TOOLS {
        store
            .tool_defaults
            .entry(tool)
            .or_insert_with(|| tool.default_pricing_template().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::resolve;

    #[test]
    fn presets_install_once_and_keep_user_defaults() {
        let mut store = PricingStore::default();
        install_presets(&mut store);
        assert_eq!(store.templates.len(), 3);
        assert_eq!(
            store.tool_defaults.get(&ToolId::Codex).map(String::as_str),
            Some("preset-codex")
        );

        store
            .tool_defaults
            .insert(ToolId::Codex, "my-template".to_string());
        install_presets(&mut store);
        assert_eq!(
            store.tool_defaults.get(&ToolId::Codex).map(String::as_str),
            Some("my-template")
        );
    }

    #[test]
    fn preset_models_resolve_with_date_suffixes() {
        let mut store = PricingStore::default();
        install_presets(&mut store);
        let hit = resolve(&store, "preset-claude", "claude-sonnet-4-20250514").unwrap();
        assert_eq!(hit.input_per_1m, 3.0);
    }
}
