// ABOUTME: Capability matching - scores agents against a task's skill and language requirements.
// ABOUTME: Pure functions; eligibility needs every required entry, preferences raise the score.

use crate::error::{DroverError, DroverResult};
use crate::types::{AgentCapabilities, AgentEntity, Task};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Task metadata key holding the requirements object
pub const REQUIREMENTS_KEY: &str = "capabilityRequirements";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskCapabilityRequirements {
    pub required_skills: Vec<String>,
    pub preferred_skills: Vec<String>,
    pub required_languages: Vec<String>,
    pub preferred_languages: Vec<String>,
}

impl TaskCapabilityRequirements {
    pub fn is_empty(&self) -> bool {
        self.required_skills.is_empty()
            && self.preferred_skills.is_empty()
            && self.required_languages.is_empty()
            && self.preferred_languages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMatchResult {
    pub is_eligible: bool,
    /// 0..=100, always 0 when not eligible
    pub score: u8,
    pub matched_required_skills: Vec<String>,
    pub matched_preferred_skills: Vec<String>,
    pub missing_required_skills: Vec<String>,
    pub matched_required_languages: Vec<String>,
    pub matched_preferred_languages: Vec<String>,
    pub missing_required_languages: Vec<String>,
}

/// Case-fold and trim
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn normalize_set<'a>(values: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| normalize(v))
        .filter(|v| !v.is_empty())
        .collect()
}

fn ratio(matched: usize, preferred: usize) -> f64 {
    if preferred == 0 {
        1.0
    } else {
        matched as f64 / preferred as f64
    }
}

pub fn match_capabilities(
    agent: &AgentCapabilities,
    requirements: &TaskCapabilityRequirements,
) -> CapabilityMatchResult {
    let skills = normalize_set(&agent.skills);
    let languages = normalize_set(&agent.languages);

    let required_skills = normalize_set(&requirements.required_skills);
    let preferred_skills = normalize_set(&requirements.preferred_skills);
    let required_languages = normalize_set(&requirements.required_languages);
    let preferred_languages = normalize_set(&requirements.preferred_languages);

    let matched_required_skills: Vec<String> =
        required_skills.intersection(&skills).cloned().collect();
    let missing_required_skills: Vec<String> =
        required_skills.difference(&skills).cloned().collect();
    let matched_preferred_skills: Vec<String> =
        preferred_skills.intersection(&skills).cloned().collect();
    let matched_required_languages: Vec<String> =
        required_languages.intersection(&languages).cloned().collect();
    let missing_required_languages: Vec<String> =
        required_languages.difference(&languages).cloned().collect();
    let matched_preferred_languages: Vec<String> =
        preferred_languages.intersection(&languages).cloned().collect();

    let is_eligible = missing_required_skills.is_empty() && missing_required_languages.is_empty();
    let score = if is_eligible {
        let raw = 50.0
            + 25.0 * ratio(matched_preferred_skills.len(), preferred_skills.len())
            + 25.0 * ratio(matched_preferred_languages.len(), preferred_languages.len());
        raw.round().clamp(0.0, 100.0) as u8
    } else {
        0
    };

    CapabilityMatchResult {
        is_eligible,
        score,
        matched_required_skills,
        matched_preferred_skills,
        missing_required_skills,
        matched_required_languages,
        matched_preferred_languages,
        missing_required_languages,
    }
}

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub eligible_only: bool,
    pub min_score: u8,
    pub limit: Option<usize>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            eligible_only: true,
            min_score: 0,
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentMatch {
    pub agent: AgentEntity,
    pub result: CapabilityMatchResult,
}

/// Rank agents by score, highest first. Equal scores keep input order.
pub fn find_agents_for_requirements(
    agents: &[AgentEntity],
    requirements: &TaskCapabilityRequirements,
    options: &MatchOptions,
) -> Vec<AgentMatch> {
    let mut matches: Vec<AgentMatch> = agents
        .iter()
        .map(|agent| AgentMatch {
            result: match_capabilities(&agent.capabilities, requirements),
            agent: agent.clone(),
        })
        .filter(|m| !options.eligible_only || m.result.is_eligible)
        .filter(|m| m.result.score >= options.min_score)
        .collect();

    // sort_by is stable
    matches.sort_by(|a, b| b.result.score.cmp(&a.result.score));

    if let Some(limit) = options.limit {
        matches.truncate(limit);
    }
    matches
}

/// Requirements stored under the task's metadata; malformed or absent means none
pub fn requirements_for_task(task: &Task) -> TaskCapabilityRequirements {
    let Some(raw) = task.metadata.get(REQUIREMENTS_KEY) else {
        return TaskCapabilityRequirements::default();
    };
    serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
        tracing::warn!(
            task_id = %task.id,
            error = %e,
            "Ignoring malformed capability requirements"
        );
        TaskCapabilityRequirements::default()
    })
}

pub fn find_agents_for_task(
    agents: &[AgentEntity],
    task: &Task,
    options: &MatchOptions,
) -> Vec<AgentMatch> {
    find_agents_for_requirements(agents, &requirements_for_task(task), options)
}

/// Top eligible agent for a task
pub fn get_best_agent_for_task(agents: &[AgentEntity], task: &Task) -> Option<AgentMatch> {
    let options = MatchOptions {
        limit: Some(1),
        ..Default::default()
    };
    find_agents_for_task(agents, task, &options).into_iter().next()
}

/// Reject blank skill or language entries
pub fn validate_capabilities(capabilities: &AgentCapabilities) -> DroverResult<()> {
    if capabilities.skills.iter().any(|s| s.trim().is_empty()) {
        return Err(DroverError::InvalidAgent(
            "skills must not contain empty entries".to_string(),
        ));
    }
    if capabilities.languages.iter().any(|l| l.trim().is_empty()) {
        return Err(DroverError::InvalidAgent(
            "languages must not contain empty entries".to_string(),
        ));
    }
    Ok(())
}

pub fn agent_has_skill(capabilities: &AgentCapabilities, skill: &str) -> bool {
    let wanted = normalize(skill);
    capabilities.skills.iter().any(|s| normalize(s) == wanted)
}

pub fn agent_has_language(capabilities: &AgentCapabilities, language: &str) -> bool {
    let wanted = normalize(language);
    capabilities.languages.iter().any(|l| normalize(l) == wanted)
}
