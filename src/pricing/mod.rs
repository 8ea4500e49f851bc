// Pricing engine - resolves model names against templates and prices usage
//
// Templates come in two layers: custom_models (direct price cards, with
// aliases) and inherited_models (a reference into another template scaled
// by a multiplier). Inheritance must form a DAG; resolution walks it with
// a seen-set and a depth cap of 16.

mod presets;

pub use presets::install_presets;

use std::collections::HashSet;

use crate::error::{CoreError, ErrorKind};
use crate::models::{ModelPrice, PricingStore, TokenCounters, TokenCosts};

const MAX_INHERITANCE_DEPTH: usize = 16;

/// Normalize a model name for lookup: lowercase, trailing -YYYYMMDD date
/// suffix stripped ("claude-opus-4-20250514" -> "claude-opus-4").
pub fn normalize_model_name(model: &str) -> String {
    let lower = model.to_lowercase();
    if let Some(idx) = lower.rfind('-') {
        let suffix = &lower[idx + 1..];
        if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_digit()) {
            return lower[..idx].to_string();
        }
    }
    lower
}

/// Resolve a model's effective price within a template.
pub fn resolve(
    store: &PricingStore,
    template_id: &str,
    model_name: &str,
) -> Result<ModelPrice, CoreError> {
    let mut seen = HashSet::new();
    resolve_inner(store, template_id, model_name, &mut seen, 0)
}

fn resolve_inner(
    store: &PricingStore,
    template_id: &str,
    model_name: &str,
    seen: &mut HashSet<String>,
    depth: usize,
) -> Result<ModelPrice, CoreError> {
    if depth > MAX_INHERITANCE_DEPTH || !seen.insert(template_id.to_string()) {
        return Err(CoreError::new(
            ErrorKind::PricingCycle,
            format!("inheritance cycle through template {template_id}"),
        ));
    }

    let template = store.templates.get(template_id).ok_or_else(|| {
        CoreError::new(
            ErrorKind::PricingMissing,
            format!("pricing template {template_id} not found"),
        )
    })?;

    let wanted = normalize_model_name(model_name);

    // Direct hit: model key or any alias, case-insensitive
    for (name, price) in &template.custom_models {
        if normalize_model_name(name) == wanted {
            return Ok(price.clone());
        }
        if price
            .aliases
            .iter()
            .any(|a| normalize_model_name(a) == wanted)
        {
            return Ok(price.clone());
        }
    }

    // First matching inherited entry resolves through its source template
    for entry in &template.inherited_models {
        if normalize_model_name(&entry.model_name) == wanted {
            let base = resolve_inner(
                store,
                &entry.source_template_id,
                &entry.model_name,
                seen,
                depth + 1,
            )?;
            return Ok(base.scaled(entry.multiplier));
        }
    }

    Err(CoreError::new(
        ErrorKind::PricingMissing,
        format!("no price for model {model_name} in template {template_id}"),
    ))
}

/// Price a counter set. Six-decimal precision, per-million rates.
pub fn cost(price: &ModelPrice, counters: &TokenCounters) -> TokenCosts {
    let round6 = |v: f64| (v * 1_000_000.0).round() / 1_000_000.0;

    let input = round6(counters.input as f64 * price.input_per_1m / 1_000_000.0);
    let output = round6(counters.output as f64 * price.output_per_1m / 1_000_000.0);
    let cache_write =
        round6(counters.cache_creation as f64 * price.cache_write_per_1m / 1_000_000.0);
    let cache_read = round6(counters.cache_read as f64 * price.cache_read_per_1m / 1_000_000.0);

    TokenCosts {
        input,
        output,
        cache_write,
        cache_read,
        total: round6(input + output + cache_write + cache_read),
    }
}

/// Validate a template against the store it will live in: every source
/// template must exist and the inheritance graph must stay acyclic.
pub fn validate_template(
    store: &PricingStore,
    template: &crate::models::PricingTemplate,
) -> Result<(), CoreError> {
    // Probe each inherited entry in a store that already includes this
    // template, so self-references and new cycles are caught.
    let mut probe = store.clone();
    probe
        .templates
        .insert(template.id.clone(), template.clone());

    for entry in &template.inherited_models {
        if !probe.templates.contains_key(&entry.source_template_id) {
            return Err(CoreError::new(
                ErrorKind::PricingMissing,
                format!("source template {} not found", entry.source_template_id),
            ));
        }
        let mut seen = HashSet::new();
        seen.insert(template.id.clone());
        match resolve_inner(
            &probe,
            &entry.source_template_id,
            &entry.model_name,
            &mut seen,
            1,
        ) {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::PricingCycle => return Err(e),
            // Missing model in the source is allowed at save time; it only
            // fails at resolution
            Err(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InheritedModel, PricingTemplate};
    use std::collections::HashMap;

    fn price(input: f64, output: f64) -> ModelPrice {
        ModelPrice {
            provider: "anthropic".into(),
            input_per_1m: input,
            output_per_1m: output,
            cache_write_per_1m: input * 1.25,
            cache_read_per_1m: input * 0.1,
            currency: "USD".into(),
            aliases: vec![],
        }
    }

    fn store_with(templates: Vec<PricingTemplate>) -> PricingStore {
        PricingStore {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
            tool_defaults: HashMap::new(),
        }
    }

    #[test]
    fn normalize_strips_date_suffix() {
        assert_eq!(
            normalize_model_name("claude-opus-4-20250514"),
            "claude-opus-4"
        );
        assert_eq!(normalize_model_name("GPT-5-Codex"), "gpt-5-codex");
        // Short numeric tails are not dates
        assert_eq!(normalize_model_name("gemini-2.5-pro"), "gemini-2.5-pro");
    }

    #[test]
    fn resolves_via_alias() {
        let mut custom = HashMap::new();
        let mut p = price(3.0, 15.0);
        p.aliases = vec!["sonnet-latest".into()];
        custom.insert("claude-sonnet-4".into(), p);
        let store = store_with(vec![PricingTemplate {
            id: "t1".into(),
            name: "base".into(),
            is_default_preset: false,
            inherited_models: vec![],
            custom_models: custom,
        }]);

        let hit = resolve(&store, "t1", "Sonnet-Latest").unwrap();
        assert_eq!(hit.input_per_1m, 3.0);
    }

    #[test]
    fn inherited_model_scales_by_multiplier() {
        let mut base_models = HashMap::new();
        base_models.insert("claude-sonnet-4".into(), price(3.0, 15.0));
        let base = PricingTemplate {
            id: "base".into(),
            name: "base".into(),
            is_default_preset: true,
            inherited_models: vec![],
            custom_models: base_models,
        };
        let reseller = PricingTemplate {
            id: "reseller".into(),
            name: "reseller".into(),
            is_default_preset: false,
            inherited_models: vec![InheritedModel {
                model_name: "claude-sonnet-4".into(),
                source_template_id: "base".into(),
                multiplier: 0.5,
            }],
            custom_models: HashMap::new(),
        };
        let store = store_with(vec![base, reseller]);

        let hit = resolve(&store, "reseller", "claude-sonnet-4-20250514").unwrap();
        assert_eq!(hit.input_per_1m, 1.5);
        assert_eq!(hit.output_per_1m, 7.5);
    }

    #[test]
    fn cycle_is_detected() {
        let a = PricingTemplate {
            id: "a".into(),
            name: "a".into(),
            is_default_preset: false,
            inherited_models: vec![InheritedModel {
                model_name: "m".into(),
                source_template_id: "b".into(),
                multiplier: 1.0,
            }],
            custom_models: HashMap::new(),
        };
        let b = PricingTemplate {
            id: "b".into(),
            name: "b".into(),
            is_default_preset: false,
            inherited_models: vec![InheritedModel {
                model_name: "m".into(),
                source_template_id: "a".into(),
                multiplier: 1.0,
            }],
            custom_models: HashMap::new(),
        };
        let store = store_with(vec![a, b]);

        let err = resolve(&store, "a", "m").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PricingCycle);
    }

    #[test]
    fn missing_model_is_pricing_missing() {
        let store = store_with(vec![PricingTemplate {
            id: "t".into(),
            name: "t".into(),
            ..Default::default()
        }]);
        let err = resolve(&store, "t", "unknown-model").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PricingMissing);
    }

    #[test]
    fn cost_rounds_to_six_decimals() {
        let p = price(3.0, 15.0);
        let counters = TokenCounters {
            input: 10,
            output: 10,
            cache_creation: 0,
            cache_read: 0,
        };
        let c = cost(&p, &counters);
        assert_eq!(c.input, 0.00003);
        assert_eq!(c.output, 0.00015);
        assert_eq!(c.total, 0.00018);
    }

    #[test]
    fn validate_rejects_unknown_source() {
        let store = store_with(vec![]);
        let t = PricingTemplate {
            id: "x".into(),
            name: "x".into(),
            inherited_models: vec![InheritedModel {
                model_name: "m".into(),
                source_template_id: "ghost".into(),
                multiplier: 1.0,
            }],
            ..Default::default()
        };
        let err = validate_template(&store, &t).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PricingMissing);
    }
}
