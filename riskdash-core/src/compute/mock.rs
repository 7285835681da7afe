// Deterministic placeholder AI functions, seeded from the record id.
// Payload content is illustrative only; the same id always yields the same payload.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::datasets::Dataset;

use super::{Computation, ComputeInput, ComputeRegistry};

/// Delay applied by `slow_enrichment` unless overridden.
pub const DEFAULT_SLOW_DELAY: Duration = Duration::from_millis(250);

const ISSUE_PRIMARY: &[&str] = &[
    "Operational Resilience",
    "Conduct & Culture",
    "Technology Change",
    "Regulatory Compliance",
    "Fraud & Financial Crime",
];

const ISSUE_SECONDARY: &[&str] = &[
    "Process Oversight",
    "Training Gap",
    "Latency Management",
    "Data Integrity",
    "Vendor Oversight",
    "Threshold Calibration",
];

const ROOT_CAUSE_PRIMARY: &[&str] = &[
    "Process Breakdown",
    "Human Factors",
    "Technology Defect",
    "Governance Gap",
    "Third-Party Exposure",
];

const ROOT_CAUSE_SECONDARY: &[&str] = &[
    "Change Collision",
    "Insufficient Monitoring",
    "Incomplete Playbook",
    "Policy Misalignment",
    "Delayed Detection",
];

const CONTROL_PRIMARY: &[&str] = &[
    "Preventive Control",
    "Detective Control",
    "Corrective Control",
    "Compensating Control",
];

const CONTROL_SECONDARY: &[&str] = &[
    "Application Embedded",
    "Procedural",
    "Automated Monitoring",
    "Manual Review",
];

const REASONING: &[&str] = &[
    "Historic incidents show recurring gaps.",
    "Control evidence indicates limited coverage.",
    "Process walkthroughs highlight missing ownership.",
    "Audit observations describe inconsistent execution.",
    "Frontline testing reveals delayed remediation.",
];

/// RNG seeded from the first eight bytes of SHA-256(id).
fn seeded(id: &str) -> StdRng {
    let digest = Sha256::digest(id.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    StdRng::seed_from_u64(u64::from_be_bytes(seed))
}

fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
    values.choose(rng).copied().unwrap_or_default()
}

fn pick_two(rng: &mut StdRng, values: &[&str]) -> Vec<String> {
    values
        .choose_multiple(rng, 2)
        .map(|s| (*s).to_string())
        .collect()
}

fn reasoning(rng: &mut StdRng, topic: &str) -> Value {
    json!([
        format!("{topic}: {}", pick(rng, REASONING)),
        format!("Further monitoring recommended around {}.", topic.to_lowercase()),
    ])
}

/// Two distinct labels from `primary ++ secondary`.
fn primary_secondary(rng: &mut StdRng, primary: &[&str], secondary: &[&str]) -> (String, String) {
    let pool: Vec<&str> = primary.iter().chain(secondary).copied().collect();
    let first = pick(rng, &pool);
    let rest: Vec<&str> = pool.iter().copied().filter(|v| *v != first).collect();
    let second = if rest.is_empty() { first } else { pick(rng, &rest) };
    (first.to_string(), second.to_string())
}

fn taxonomy(id: &str, primary: &[&str], secondary: &[&str]) -> Value {
    let mut rng = seeded(id);
    let (first, second) = primary_secondary(&mut rng, primary, secondary);
    json!({
        "primary_taxonomy": first,
        "secondary_taxonomy": second,
        "primary_taxonomy_reasoning": reasoning(&mut rng, &first),
        "secondary_taxonomy_reasoning": reasoning(&mut rng, &second),
    })
}

pub fn issue_taxonomy(id: &str) -> Value {
    taxonomy(id, ISSUE_PRIMARY, ISSUE_SECONDARY)
}

pub fn controls_taxonomy(id: &str) -> Value {
    taxonomy(id, CONTROL_PRIMARY, CONTROL_SECONDARY)
}

pub fn root_cause(id: &str) -> Value {
    let mut rng = seeded(id);
    let (first, second) = primary_secondary(&mut rng, ROOT_CAUSE_PRIMARY, ROOT_CAUSE_SECONDARY);
    json!({
        "primary_root_cause": first,
        "secondary_root_cause": second,
        "primary_root_cause_reasoning": reasoning(&mut rng, &first),
        "secondary_root_cause_reasoning": reasoning(&mut rng, &second),
    })
}

pub fn issue_enrichment(id: &str) -> Value {
    let mut rng = seeded(id);
    let exposure = pick(
        &mut rng,
        &["persistent gaps", "heightened exposure", "escalating oversight needs"],
    );
    json!({
        "summary": format!("Case {id} highlights {exposure} within the current workflow."),
        "impacts": {
            "financial": pick(&mut rng, &["High", "Medium", "Low"]),
            "reputation": pick(&mut rng, &["Moderate", "Elevated", "Contained"]),
            "regulatory": pick(&mut rng, &["Reportable", "Monitoring Only", "Advisory"]),
        },
        "factors": {
            "internal": pick_two(&mut rng, &["Process complexity", "Legacy tooling", "Manual workarounds", "Competing priorities"]),
            "external": pick_two(&mut rng, &["Vendor dependency", "Market pressure", "Regulatory change", "Customer expectations"]),
        },
        "dealing": {
            "immediate": pick(&mut rng, &[
                "Stabilize impacted workflow and add oversight.",
                "Pause non-critical deployments and conduct validation.",
                "Issue interim guidance to frontline teams.",
            ]),
            "long_term": pick(&mut rng, &[
                "Embed automated controls and real-time monitoring.",
                "Refresh policy playbooks and training cadence.",
                "Strengthen handoffs with accountable owners.",
            ]),
            "owner": pick(&mut rng, &["First Line", "Second Line", "Product Team", "Operations Lead"]),
        },
    })
}

pub fn controls_enrichment(id: &str) -> Value {
    let mut rng = seeded(id);
    json!({
        "summary": format!("Control {id} addresses the primary risk scenario described in the context."),
        "5ws": {
            "who": pick(&mut rng, &["Risk Operations", "Front Office", "Technology", "Compliance"]),
            "what": pick(&mut rng, &["Monitors critical thresholds", "Approves key changes", "Reviews exception queues", "Validates inputs"]),
            "when": pick(&mut rng, &["Daily", "Weekly", "Per deployment", "Real-time"]),
            "where": pick(&mut rng, &["Global platform", "Regional process", "Shared service center", "Cloud workload"]),
            "why": pick(&mut rng, &["Maintains regulatory obligations", "Prevents fraud scenarios", "Ensures service availability", "Protects customer outcomes"]),
        },
        "factors": {
            "coverage": pick(&mut rng, &["End-to-end", "Partial", "Targeted"]),
            "automation_level": pick(&mut rng, &["Manual", "Semi-automated", "Fully automated"]),
            "dependencies": pick_two(&mut rng, &["IAM", "Logging", "Alerting", "Vendor feeds", "Ticketing"]),
        },
        "dealing": {
            "immediate": pick(&mut rng, &[
                "Validate the latest control execution evidence.",
                "Confirm fallback procedures and manual oversight.",
                "Escalate exceptions to accountable owner.",
            ]),
            "long_term": pick(&mut rng, &[
                "Integrate telemetry to monitor adherence.",
                "Embed control within deployment toolchain.",
                "Consolidate duplicative steps with automation.",
            ]),
            "owner": pick(&mut rng, &["Control Office", "Product Risk Lead", "Process Owner"]),
        },
        "confidence": rng.gen_range(60..=95),
    })
}

fn enrichment_for(dataset: Dataset, id: &str) -> Value {
    match dataset {
        Dataset::Controls => controls_enrichment(id),
        _ => issue_enrichment(id),
    }
}

impl ComputeRegistry {
    /// Registry with a deterministic placeholder for every declared function.
    pub fn with_mock_functions() -> Self {
        Self::with_mock_functions_delay(DEFAULT_SLOW_DELAY)
    }

    /// Same as [`with_mock_functions`](Self::with_mock_functions) with a
    /// custom `slow_enrichment` delay.
    pub fn with_mock_functions_delay(delay: Duration) -> Self {
        let mut registry = Self::new();
        for dataset in Dataset::ALL {
            for function in dataset.config().ai_functions {
                let result = match *function {
                    "issue_taxonomy" => registry.register(dataset, function, |i: ComputeInput| {
                        Computation::ready(issue_taxonomy(&i.id))
                    }),
                    "controls_taxonomy" => {
                        registry.register(dataset, function, |i: ComputeInput| {
                            Computation::ready(controls_taxonomy(&i.id))
                        })
                    }
                    "root_cause" => registry.register(dataset, function, |i: ComputeInput| {
                        Computation::ready(root_cause(&i.id))
                    }),
                    "enrichment" => registry.register(dataset, function, |i: ComputeInput| {
                        Computation::ready(enrichment_for(i.dataset, &i.id))
                    }),
                    "slow_enrichment" => {
                        registry.register(dataset, function, move |i: ComputeInput| {
                            Computation::pending(async move {
                                tokio::time::sleep(delay).await;
                                Ok(enrichment_for(i.dataset, &i.id))
                            })
                        })
                    }
                    _ => continue,
                };
                if let Err(e) = result {
                    tracing::warn!(%dataset, function, error = %e, "mock registration skipped");
                }
            }
        }
        registry
    }
}
