//! Job definition parsing and validation.

use crate::condition::Condition;
use crate::nodes::{all_string_args, first_i32_arg, first_string_arg, string_map, string_prop};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use opencicd_core::job::{JobDefinition, StepCondition, StepDefinition};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Parse a job definition from KDL text.
///
/// ```kdl
/// job "build" {
///     repository "https://example.com/app.git"
///     branches "main" "release/*"
///     requires "docker"
///     step "checkout" { run "git checkout ${git.sha}" }
/// }
/// ```
pub fn parse_job(kdl: &str) -> ConfigResult<JobDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut jobs = doc.nodes().iter().filter(|n| n.name().value() == "job");
    let node = jobs
        .next()
        .ok_or_else(|| ConfigError::MissingField("job".to_string()))?;
    if jobs.next().is_some() {
        return Err(ConfigError::Duplicate(
            "only one job may be defined per document".to_string(),
        ));
    }

    let definition = parse_job_node(node)?;
    validate_job(&definition)?;
    Ok(definition)
}

fn parse_job_node(node: &KdlNode) -> ConfigResult<JobDefinition> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut repository = None;
    let mut branches = Vec::new();
    let mut requires = BTreeSet::new();
    let mut priority = 0;
    let mut env = BTreeMap::new();
    let mut steps = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "repository" => repository = first_string_arg(child),
                "branches" => branches.extend(all_string_args(child)),
                "requires" => requires.extend(all_string_args(child)),
                "priority" => priority = first_i32_arg(child, "priority")?,
                "env" => env = string_map(child),
                "step" => steps.push(parse_step(child)?),
                _ => {} // Ignore unknown nodes
            }
        }
    }

    let repository = repository
        .ok_or_else(|| ConfigError::MissingField(format!("repository for job '{}'", name)))?;

    Ok(JobDefinition {
        name,
        repository,
        branches,
        requires,
        priority,
        env,
        steps,
    })
}

fn parse_step(node: &KdlNode) -> ConfigResult<StepDefinition> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;
    let when = string_prop(node, "when").map(|expression| StepCondition { expression });

    let mut commands = Vec::new();
    let mut env = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "env" => env = string_map(child),
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for step '{}'",
            name
        )));
    }

    Ok(StepDefinition {
        name,
        command: commands.join("\n"),
        env,
        when,
    })
}

/// Full validation of a job definition, whichever format it arrived in.
pub fn validate_job(definition: &JobDefinition) -> ConfigResult<()> {
    definition
        .validate()
        .map_err(|e| ConfigError::InvalidJob(e.to_string()))?;

    validate_steps(&definition.steps)?;

    for pattern in &definition.branches {
        branch_regex(pattern)?;
    }
    Ok(())
}

/// Validation of a replacement step list.
pub fn validate_steps(steps: &[StepDefinition]) -> ConfigResult<()> {
    for step in steps {
        if let Some(when) = &step.when {
            Condition::parse(&when.expression)?;
        }
    }
    Ok(())
}

/// Whether `branch` matches any of `patterns`. An empty list matches every branch.
pub fn branch_matches(patterns: &[String], branch: &str) -> bool {
    patterns.is_empty()
        || patterns
            .iter()
            .filter_map(|p| branch_regex(p).ok())
            .any(|re| re.is_match(branch))
}

/// `*` matches any run of characters; everything else is literal.
fn branch_regex(pattern: &str) -> ConfigResult<Regex> {
    if pattern.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "branches".to_string(),
            message: "empty branch pattern".to_string(),
        });
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| ConfigError::InvalidValue {
        field: "branches".to_string(),
        message: e.to_string(),
    })
}
