//! Job definitions.
//!
//! A job is a versioned template. Runs pin the `(id, version)` they were created from, so
//! editing a job never changes a run that already exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::{Error, ResourceId, Result};

/// Condition for step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Expression to evaluate (e.g., "${git.branch} == 'main'").
    pub expression: String,
}

/// One step of a job template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Shell command the agent runs.
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Step is skipped when this evaluates false as its predecessor finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<StepCondition>,
}

/// What a client submits to create or replace a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// Repository URL.
    pub repository: String,
    /// Branch patterns that trigger push runs (`*` wildcard). Empty means any branch.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Capability tags an agent must carry to run this job.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Default priority tier for runs of this job.
    #[serde(default)]
    pub priority: i32,
    /// Job-wide environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    /// Structural validation. Step conditions are validated by the config crate.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("job name must not be empty".to_string()));
        }
        validate_steps(&self.steps)
    }
}

pub(crate) fn validate_steps(steps: &[StepDefinition]) -> Result<()> {
    if steps.is_empty() {
        return Err(Error::InvalidInput(
            "job must declare at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(Error::InvalidInput("step name must not be empty".to_string()));
        }
        if step.command.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "step '{}' has no command",
                step.name
            )));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }
    Ok(())
}

/// A stored job version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    /// Starts at 1; every edit stores a new version.
    pub version: u32,
    pub name: String,
    pub repository: String,
    pub branches: Vec<String>,
    pub requires: BTreeSet<String>,
    pub priority: i32,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
    /// Soft-delete tombstone. Deleted jobs keep their history but accept no new runs.
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// First version of a new job.
    pub fn create(definition: JobDefinition, now: DateTime<Utc>) -> Result<Self> {
        definition.validate()?;
        Ok(Self {
            id: ResourceId::new(),
            version: 1,
            name: definition.name,
            repository: definition.repository,
            branches: definition.branches,
            requires: definition.requires,
            priority: definition.priority,
            env: definition.env,
            steps: definition.steps,
            deleted: false,
            created_at: now,
        })
    }

    /// Next version with its step list replaced.
    pub fn with_steps(&self, steps: Vec<StepDefinition>, now: DateTime<Utc>) -> Result<Self> {
        if self.deleted {
            return Err(Error::InvalidInput(format!("job {} is deleted", self.id)));
        }
        validate_steps(&steps)?;
        Ok(Self {
            version: self.version + 1,
            steps,
            created_at: now,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            command: format!("make {name}"),
            env: BTreeMap::new(),
            when: None,
        }
    }

    fn definition(steps: Vec<StepDefinition>) -> JobDefinition {
        JobDefinition {
            name: "build".to_string(),
            repository: "https://example.com/app.git".to_string(),
            branches: vec![],
            requires: BTreeSet::new(),
            priority: 0,
            env: BTreeMap::new(),
            steps,
        }
    }

    #[test]
    fn test_create_starts_at_version_one() {
        let job = Job::create(definition(vec![step("checkout")]), Utc::now()).unwrap();
        assert_eq!(job.version, 1);
        assert!(!job.deleted);
    }

    #[test]
    fn test_replacing_steps_bumps_version_and_keeps_identity() {
        let job = Job::create(definition(vec![step("checkout")]), Utc::now()).unwrap();
        let next = job
            .with_steps(vec![step("checkout"), step("test")], Utc::now())
            .unwrap();
        assert_eq!(next.id, job.id);
        assert_eq!(next.version, 2);
        assert_eq!(next.steps.len(), 2);
        assert_eq!(job.steps.len(), 1);
    }

    #[test]
    fn test_rejects_duplicate_and_empty_steps() {
        assert!(definition(vec![]).validate().is_err());
        assert!(
            definition(vec![step("test"), step("test")])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_deleted_job_cannot_be_edited() {
        let mut job = Job::create(definition(vec![step("checkout")]), Utc::now()).unwrap();
        job.deleted = true;
        assert!(job.with_steps(vec![step("test")], Utc::now()).is_err());
    }
}
