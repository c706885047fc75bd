// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider inference from conversation context.
//!
//! When the model calls `cloud_exec` without a provider preference, the
//! recent user messages are scored against a per-provider matrix of
//! keywords, service names, CLI mentions and deployment phrases.  The
//! latest message outweighs history: an explicit mention there overrides
//! whatever the conversation was about before.

use tracing::debug;

use aurora_config::CloudProvider;

struct ProviderPatterns {
    provider: CloudProvider,
    primary_keywords: &'static [&'static str],
    services: &'static [&'static str],
    cli_patterns: &'static [&'static str],
    deployment_patterns: &'static [&'static str],
    high_confidence_queries: &'static [&'static str],
    regional_hints: &'static [&'static str],
}

static PATTERNS: &[ProviderPatterns] = &[
    ProviderPatterns {
        provider: CloudProvider::Gcp,
        primary_keywords: &["gcp", "google cloud", "google", "gce"],
        services: &[
            "cloud run",
            "cloud functions",
            "app engine",
            "gke",
            "kubernetes engine",
            "compute engine",
            "cloud storage",
            "bigquery",
            "cloud sql",
            "firestore",
            "cloud build",
            "pub/sub",
            "cloud dns",
            "vertex ai",
            "dataflow",
            "cloud spanner",
        ],
        cli_patterns: &["gcloud", "gsutil", "bq "],
        deployment_patterns: &[
            "deploy to gcp",
            "deploy on google",
            "deploy to google cloud",
            "create gcp",
            "use gcp",
            "with gcp",
            "on gcp",
            "in gcp",
        ],
        high_confidence_queries: &[
            "list projects",
            "show projects",
            "get projects",
            "projects list",
            "list gcp projects",
            "gcp projects",
            "google projects",
            "cloud projects",
        ],
        regional_hints: &[
            "us-central",
            "europe-west",
            "asia-southeast",
            "northamerica-northeast",
        ],
    },
    ProviderPatterns {
        provider: CloudProvider::Aws,
        primary_keywords: &["aws", "amazon web services", "amazon"],
        services: &[
            "ec2",
            "eks",
            "ecs",
            "fargate",
            "lambda",
            "elastic beanstalk",
            "s3",
            "rds",
            "dynamodb",
            "redshift",
            "sqs",
            "sns",
            "cloudformation",
            "cloudwatch",
            "route53",
            "cloudfront",
            "api gateway",
            "sagemaker",
        ],
        cli_patterns: &["aws cli", "aws "],
        deployment_patterns: &[
            "deploy to aws",
            "deploy on amazon",
            "create aws",
            "use aws",
            "with aws",
            "on aws",
            "in aws",
        ],
        high_confidence_queries: &[
            "list accounts",
            "show accounts",
            "aws accounts",
            "amazon accounts",
        ],
        regional_hints: &["us-east-1", "us-west-2", "eu-west-1", "ap-southeast"],
    },
    ProviderPatterns {
        provider: CloudProvider::Azure,
        primary_keywords: &["azure", "microsoft azure", "microsoft"],
        services: &[
            "aks",
            "azure kubernetes service",
            "azure functions",
            "app service",
            "azure sql",
            "cosmos db",
            "azure storage",
            "azure blob",
            "service bus",
            "azure monitor",
            "application insights",
            "key vault",
            "azure devops",
            "azure container registry",
        ],
        cli_patterns: &["az cli", "azure cli", "az "],
        deployment_patterns: &[
            "deploy to azure",
            "deploy on microsoft",
            "create azure",
            "use azure",
            "with azure",
            "on azure",
            "in azure",
        ],
        high_confidence_queries: &[
            "list subscriptions",
            "show subscriptions",
            "subscriptions list",
            "azure subscriptions",
            "subscription list",
            "list subs",
        ],
        regional_hints: &["east us", "west us", "west europe", "southeast asia"],
    },
    ProviderPatterns {
        provider: CloudProvider::Ovh,
        primary_keywords: &["ovh", "ovhcloud", "ovh cloud"],
        services: &[
            "public cloud project",
            "ovh instance",
            "ovh kubernetes",
            "object storage",
        ],
        cli_patterns: &["ovhcloud"],
        deployment_patterns: &["deploy to ovh", "create ovh", "use ovh", "on ovh", "in ovh"],
        high_confidence_queries: &["list flavors", "list-flavors", "ovh regions"],
        regional_hints: &["gra", "sbg", "bhs", "waw"],
    },
    ProviderPatterns {
        provider: CloudProvider::Scaleway,
        primary_keywords: &["scaleway", "scw", "scaleway cloud"],
        services: &["scaleway instance", "kapsule", "scaleway bucket"],
        cli_patterns: &["scw "],
        deployment_patterns: &[
            "deploy to scaleway",
            "create scaleway",
            "use scaleway",
            "on scaleway",
            "in scaleway",
        ],
        high_confidence_queries: &["list scaleway"],
        regional_hints: &["fr-par", "nl-ams", "pl-waw"],
    },
    ProviderPatterns {
        provider: CloudProvider::Tailscale,
        primary_keywords: &["tailscale", "tailnet"],
        services: &["auth key", "acl", "magic dns", "subnet router"],
        cli_patterns: &["tailscale "],
        deployment_patterns: &["on tailscale", "in the tailnet"],
        high_confidence_queries: &["list devices", "tailscale devices"],
        regional_hints: &[],
    },
];

const DEPLOYMENT_ACTIONS: &[&str] = &[
    "deploy",
    "create",
    "provision",
    "launch",
    "start",
    "build",
    "setup",
    "configure",
    "install",
    "terraform",
    "cluster",
    "instance",
    "vm",
];

/// Score the recent user messages and return the winning provider among
/// `available`.  `None` when nothing scores — the caller then falls back to
/// the first enabled provider or a requires-connection error.
pub fn determine_target_provider(
    available: &[CloudProvider],
    recent_user_messages: &[String],
) -> Option<CloudProvider> {
    if recent_user_messages.is_empty() {
        return None;
    }
    let latest = recent_user_messages
        .last()
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let recent: Vec<String> = recent_user_messages
        .iter()
        .rev()
        .take(3)
        .map(|s| s.to_ascii_lowercase())
        .collect();
    let combined = recent.join(" ");

    // Does the latest message name any available provider explicitly?
    let latest_has_provider = PATTERNS
        .iter()
        .filter(|p| available.contains(&p.provider))
        .any(|p| {
            p.primary_keywords.iter().any(|k| latest.contains(k))
                || p.deployment_patterns.iter().any(|k| latest.contains(k))
                || p.high_confidence_queries.iter().any(|k| latest.contains(k))
        });

    let mut best: Option<(CloudProvider, u32)> = None;
    for patterns in PATTERNS.iter().filter(|p| available.contains(&p.provider)) {
        let mut score: u32 = 0;

        for k in patterns.primary_keywords {
            if combined.contains(k) {
                score += 10;
            }
        }
        for s in patterns.services {
            if combined.contains(s) {
                score += 7;
            }
        }
        for c in patterns.cli_patterns {
            if combined.contains(c) {
                score += 5;
            }
        }
        for d in patterns.deployment_patterns {
            if combined.contains(d) {
                score += 8;
            }
        }
        for a in DEPLOYMENT_ACTIONS {
            for k in patterns.primary_keywords {
                if combined.contains(a) && combined.contains(k) {
                    score += 6;
                    break;
                }
            }
        }
        for h in patterns.regional_hints {
            if combined.contains(h) {
                score += 3;
            }
        }
        for q in patterns.high_confidence_queries {
            if combined.contains(q) {
                score += 25;
                break;
            }
        }

        // Latest-message priority: when the newest message names a provider,
        // its score replaces the history-derived one entirely.
        if latest_has_provider {
            let mut latest_score: u32 = 0;
            for k in patterns.primary_keywords {
                if latest.contains(k) {
                    latest_score += 30;
                }
            }
            for q in patterns.high_confidence_queries {
                if latest.contains(q) {
                    latest_score += 35;
                    break;
                }
            }
            for d in patterns.deployment_patterns {
                if latest.contains(d) {
                    latest_score += 28;
                }
            }
            if latest_score > 0 {
                score = latest_score;
            }
        }

        if score > 0 {
            debug!(provider = %patterns.provider, score, "provider context score");
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((patterns.provider, score)),
            }
        }
    }

    best.map(|(p, _)| p)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
