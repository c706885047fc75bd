// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider inference for Terraform content and provider.tf templating.
//!
//! Disambiguation order for `write`: unambiguous resource prefixes in the
//! generated HCL win (the user may have typo'd the provider name, but the
//! model still emits correct `scaleway_` resources), then conversation
//! context, then the preference list's priority order.

use regex::Regex;
use std::sync::OnceLock;
use tracing::info;

use aurora_config::CloudProvider;

struct HclPattern {
    provider: CloudProvider,
    patterns: &'static [&'static str],
}

/// Order matters: more specific prefixes are checked before `google_`.
fn hcl_patterns() -> &'static [HclPattern] {
    static PATTERNS: &[HclPattern] = &[
        HclPattern {
            provider: CloudProvider::Scaleway,
            patterns: &[r"\bscaleway_", r#"provider\s+"scaleway""#],
        },
        HclPattern {
            provider: CloudProvider::Ovh,
            patterns: &[r"\bovh_", r#"provider\s+"ovh""#],
        },
        HclPattern {
            provider: CloudProvider::Azure,
            patterns: &[r"\bazurerm_", r"\bazuread_", r#"provider\s+"azurerm""#],
        },
        HclPattern {
            provider: CloudProvider::Aws,
            patterns: &[r"\baws_", r#"provider\s+"aws""#],
        },
        HclPattern {
            provider: CloudProvider::Gcp,
            patterns: &[r"\bgoogle_", r"\bgoogle-beta_", r#"provider\s+"google""#],
        },
    ];
    PATTERNS
}

/// Detect the provider from Terraform resource / data-source prefixes.
pub fn detect_provider_from_content(content: &str) -> Option<CloudProvider> {
    if content.is_empty() {
        return None;
    }
    static COMPILED: OnceLock<Vec<(CloudProvider, Vec<Regex>)>> = OnceLock::new();
    let compiled = COMPILED.get_or_init(|| {
        hcl_patterns()
            .iter()
            .map(|p| {
                (
                    p.provider,
                    p.patterns.iter().map(|s| Regex::new(s).unwrap()).collect(),
                )
            })
            .collect()
    });
    let lowered = content.to_ascii_lowercase();
    for (provider, regexes) in compiled {
        if regexes.iter().any(|re| re.is_match(&lowered)) {
            info!(provider = %provider, "detected provider from terraform content");
            return Some(*provider);
        }
    }
    None
}

/// True when the content carries its own `terraform {}` or `provider ""`
/// block — auto-generating provider.tf would then collide.
pub fn has_own_provider_block(content: &str) -> bool {
    static TF_RE: OnceLock<Regex> = OnceLock::new();
    static PROVIDER_RE: OnceLock<Regex> = OnceLock::new();
    let tf = TF_RE.get_or_init(|| Regex::new(r"(?m)^\s*terraform\s*\{").unwrap());
    let provider = PROVIDER_RE.get_or_init(|| Regex::new(r#"(?m)^\s*provider\s+""#).unwrap());
    tf.is_match(content) || provider.is_match(content)
}

/// Render provider.tf for the resolved provider.  `resource_id` is the
/// project / region / subscription the credentials were minted for.
pub fn provider_config(provider: CloudProvider, resource_id: &str) -> String {
    match provider {
        CloudProvider::Gcp => format!(
            r#"terraform {{
  required_providers {{
    google = {{
      source  = "hashicorp/google"
      version = "~> 5.0"
    }}
  }}
}}

provider "google" {{
  project = "{resource_id}"
  region  = "us-central1"
}}
"#
        ),
        CloudProvider::Aws => format!(
            r#"terraform {{
  required_providers {{
    aws = {{
      source  = "hashicorp/aws"
      version = "~> 5.0"
    }}
  }}
}}

provider "aws" {{
  region = "{resource_id}"
}}
"#
        ),
        CloudProvider::Azure => format!(
            r#"terraform {{
  required_providers {{
    azurerm = {{
      source  = "hashicorp/azurerm"
      version = "~> 3.0"
    }}
  }}
}}

provider "azurerm" {{
  features {{}}
  subscription_id = "{resource_id}"
}}
"#
        ),
        CloudProvider::Ovh => format!(
            r#"terraform {{
  required_providers {{
    ovh = {{
      source  = "ovh/ovh"
      version = "~> 0.44"
    }}
  }}
}}

provider "ovh" {{
  endpoint = "ovh-us"
}}

variable "service_name" {{
  default = "{resource_id}"
}}
"#
        ),
        CloudProvider::Scaleway => format!(
            r#"terraform {{
  required_providers {{
    scaleway = {{
      source  = "scaleway/scaleway"
      version = "~> 2.0"
    }}
  }}
}}

provider "scaleway" {{
  project_id = "{resource_id}"
}}
"#
        ),
        // Tailscale is not an IaC target.
        CloudProvider::Tailscale => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_prefixes_identify_providers() {
        assert_eq!(
            detect_provider_from_content("resource \"google_compute_instance\" \"vm\" {}"),
            Some(CloudProvider::Gcp)
        );
        assert_eq!(
            detect_provider_from_content("resource \"aws_instance\" \"vm\" {}"),
            Some(CloudProvider::Aws)
        );
        assert_eq!(
            detect_provider_from_content("resource \"azurerm_linux_virtual_machine\" \"vm\" {}"),
            Some(CloudProvider::Azure)
        );
        assert_eq!(
            detect_provider_from_content("resource \"scaleway_instance_server\" \"vm\" {}"),
            Some(CloudProvider::Scaleway)
        );
        assert_eq!(detect_provider_from_content("output \"ip\" {}"), None);
    }

    #[test]
    fn scaleway_beats_aws_when_both_could_match() {
        // Typo'd user prompt, correct generated resources: the scaleway_
        // prefix is checked before the broader patterns.
        let content = "resource \"scaleway_instance_server\" \"web\" { tags = [\"aws-migrated\"] }";
        assert_eq!(detect_provider_from_content(content), Some(CloudProvider::Scaleway));
    }

    #[test]
    fn provider_block_detection_handles_spacing() {
        assert!(has_own_provider_block("terraform {\n}"));
        assert!(has_own_provider_block("  terraform   {"));
        assert!(has_own_provider_block("provider \"google\" {}"));
        assert!(!has_own_provider_block("resource \"aws_instance\" \"x\" {}"));
        // Comments mentioning the word don't count.
        assert!(!has_own_provider_block("# terraform is great"));
    }

    #[test]
    fn templates_embed_the_resource_id() {
        let gcp = provider_config(CloudProvider::Gcp, "proj-1");
        assert!(gcp.contains("project = \"proj-1\""));
        let aws = provider_config(CloudProvider::Aws, "eu-west-1");
        assert!(aws.contains("region = \"eu-west-1\""));
        let azure = provider_config(CloudProvider::Azure, "sub-1");
        assert!(azure.contains("subscription_id = \"sub-1\""));
        assert!(azure.contains("features {}"));
    }

    #[test]
    fn templates_parse_as_plausible_hcl() {
        for p in [CloudProvider::Gcp, CloudProvider::Aws, CloudProvider::Azure] {
            let cfg = provider_config(p, "x");
            assert_eq!(
                cfg.matches('{').count(),
                cfg.matches('}').count(),
                "unbalanced braces for {p}"
            );
            assert!(cfg.contains("required_providers"));
        }
    }
}
