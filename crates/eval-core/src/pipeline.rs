//! Pipeline definition: ordered stages of concurrently running agent kinds.

use std::collections::BTreeSet;

use eval_state::AgentKind;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One agent kind's place in a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAgent {
    pub kind: AgentKind,
    /// At least one required kind must succeed for a completed evaluation.
    #[serde(default)]
    pub required: bool,
    /// Relative weight in the overall score.
    pub weight: f64,
}

impl StageAgent {
    pub fn new(kind: AgentKind, required: bool, weight: f64) -> Self {
        Self {
            kind,
            required,
            weight,
        }
    }
}

/// Kinds that run concurrently; the stage is a join barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub agents: Vec<StageAgent>,
}

/// Ordered stages. Later stages see the successful outputs of earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Default for Pipeline {
    /// Crawl first, then every other probe in parallel.
    fn default() -> Self {
        Pipeline {
            stages: vec![
                Stage {
                    agents: vec![StageAgent::new(AgentKind::Crawl, true, 0.12)],
                },
                Stage {
                    agents: vec![
                        StageAgent::new(AgentKind::LlmTest, true, 0.15),
                        StageAgent::new(AgentKind::Sentiment, false, 0.08),
                        StageAgent::new(AgentKind::Citation, false, 0.10),
                        StageAgent::new(AgentKind::GeoVisibility, true, 0.07),
                        StageAgent::new(AgentKind::Commerce, false, 0.12),
                    ],
                },
            ],
        }
    }
}

impl Pipeline {
    /// Every agent in stage order.
    pub fn agents(&self) -> impl Iterator<Item = &StageAgent> {
        self.stages.iter().flat_map(|s| s.agents.iter())
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.agents().map(|a| a.kind).collect()
    }

    pub fn required_kinds(&self) -> Vec<AgentKind> {
        self.agents().filter(|a| a.required).map(|a| a.kind).collect()
    }

    pub fn agent(&self, kind: AgentKind) -> Option<&StageAgent> {
        self.agents().find(|a| a.kind == kind)
    }

    pub fn weight(&self, kind: AgentKind) -> f64 {
        self.agent(kind).map(|a| a.weight).unwrap_or(0.0)
    }

    /// Non-empty stages, each kind at most once, finite non-negative weights.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("pipeline has no stages".into()));
        }
        let mut seen = BTreeSet::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.agents.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pipeline stage {} has no agents",
                    idx + 1
                )));
            }
            for agent in &stage.agents {
                if !seen.insert(agent.kind) {
                    return Err(ConfigError::Invalid(format!(
                        "agent {} appears more than once in the pipeline",
                        agent.kind
                    )));
                }
                if !agent.weight.is_finite() || agent.weight < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "agent {} has invalid weight {}",
                        agent.kind, agent.weight
                    )));
                }
            }
        }
        Ok(())
    }
}
