// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model selection and provider construction.
//!
//! Selection order: background sessions are pinned to the RCA model, an
//! explicit per-turn choice wins next, a multimodal-capable model is picked
//! when the user message carries images, and everything else gets the
//! configured default.
//!
//! Construction is provider-mode aware: `"openrouter"` routes every model
//! through the gateway; `"direct"` dispatches on the vendor prefix of the
//! model id (`anthropic/...`, `openai/...`).

use std::sync::Arc;

use anyhow::{bail, Context};

use aurora_config::{ModelConfig, SessionMode};

use crate::{AnthropicProvider, ModelProvider, OpenAICompatProvider};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Pick the model id for a turn.
pub fn select_model(
    explicit: Option<&str>,
    has_images: bool,
    mode: SessionMode,
    cfg: &ModelConfig,
) -> String {
    if mode.is_background() {
        return cfg.rca_model.clone();
    }
    if let Some(m) = explicit {
        return m.to_string();
    }
    if has_images {
        return cfg.multimodal_model.clone();
    }
    cfg.default_model.clone()
}

/// Build a provider for `model_id` according to the configured provider mode.
///
/// API keys come from the environment (`OPENROUTER_API_KEY`,
/// `ANTHROPIC_API_KEY`, `OPENAI_API_KEY`); they are read here and handed to
/// the driver, never written back into the process environment.
pub fn create_provider(model_id: &str, cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    if cfg.provider_mode == "openrouter" {
        let key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY is not set but provider_mode is openrouter")?;
        return Ok(Arc::new(
            OpenAICompatProvider::new(
                "openrouter",
                model_id.to_string(),
                key,
                OPENROUTER_BASE_URL,
                cfg.temperature,
                cfg.request_timeout_secs,
            )
            .with_header("HTTP-Referer", "https://aurora.cloud")
            .with_header("X-Title", "aurora"),
        ));
    }

    // Direct mode: dispatch on the vendor prefix.
    let (vendor, name) = model_id
        .split_once('/')
        .unwrap_or(("openai", model_id));
    match vendor {
        "anthropic" => {
            let key = std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY is not set for direct anthropic mode")?;
            Ok(Arc::new(AnthropicProvider::new(
                name.to_string(),
                key,
                cfg.temperature,
                cfg.request_timeout_secs,
            )))
        }
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is not set for direct openai mode")?;
            Ok(Arc::new(OpenAICompatProvider::new(
                "openai",
                name.to_string(),
                key,
                OPENAI_BASE_URL,
                cfg.temperature,
                cfg.request_timeout_secs,
            )))
        }
        other => bail!(
            "no direct driver for vendor '{other}'; set provider_mode: openrouter to use it"
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ModelConfig {
        ModelConfig::default()
    }

    #[test]
    fn explicit_model_wins_in_interactive_modes() {
        let m = select_model(Some("openai/gpt-4.1"), false, SessionMode::Agent, &cfg());
        assert_eq!(m, "openai/gpt-4.1");
    }

    #[test]
    fn images_pick_the_multimodal_model() {
        let m = select_model(None, true, SessionMode::Agent, &cfg());
        assert_eq!(m, cfg().multimodal_model);
    }

    #[test]
    fn no_hints_pick_the_default() {
        let m = select_model(None, false, SessionMode::Ask, &cfg());
        assert_eq!(m, cfg().default_model);
    }

    #[test]
    fn background_is_pinned_to_the_rca_model() {
        // The pin overrides even an explicit choice.
        let m = select_model(Some("openai/gpt-4o"), true, SessionMode::Background, &cfg());
        assert_eq!(m, cfg().rca_model);
    }

    #[test]
    fn direct_mode_rejects_unknown_vendor() {
        let mut c = cfg();
        c.provider_mode = "direct".into();
        let err = match create_provider("mistral/mixtral", &c) {
            Err(e) => e,
            Ok(_) => panic!("expected create_provider to fail"),
        };
        assert!(err.to_string().contains("no direct driver"));
    }
}
