// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel promotion planning.
//!
//! Moving channel definitions between environments is artifact-based: each
//! artifact names the channels it depends on, and a promotion request
//! yields an execution plan with dependencies first. Plans require the
//! configured number of approvals before they can be executed. The
//! transport (git push/pull of the artifacts) lives outside this module.

use medbridge_core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One exported channel definition plus its dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelArtifact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Serialized channel definition as exported.
    pub content: String,
}

/// A promotion request over a set of artifacts.
#[derive(Debug, Clone)]
pub struct PromotionRequest {
    artifacts: Vec<ChannelArtifact>,
    required_approvals: usize,
    approvals: HashSet<String>,
}

impl PromotionRequest {
    #[must_use]
    pub fn new(artifacts: Vec<ChannelArtifact>, required_approvals: usize) -> Self {
        Self { artifacts, required_approvals, approvals: HashSet::new() }
    }

    /// Records an approval; approving twice counts once.
    pub fn approve(&mut self, approver: &str) {
        self.approvals.insert(approver.to_string());
    }

    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.approvals.len() >= self.required_approvals
    }

    /// Produces the dependency-ordered execution plan: every artifact
    /// appears after the artifacts it depends on. Dependencies outside the
    /// requested set are assumed already present in the target environment.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when approvals are outstanding and a
    /// configuration error when the dependency graph has a cycle.
    pub fn execute(&self) -> Result<Vec<&ChannelArtifact>> {
        if !self.is_approved() {
            return Err(EngineError::Runtime(format!(
                "promotion requires {} approvals, has {}",
                self.required_approvals,
                self.approvals.len()
            )));
        }

        let requested: HashSet<&str> =
            self.artifacts.iter().map(|artifact| artifact.id.as_str()).collect();
        let mut plan: Vec<&ChannelArtifact> = Vec::with_capacity(self.artifacts.len());
        let mut planned: HashSet<&str> = HashSet::new();

        // Repeatedly take every artifact whose in-set dependencies are
        // already planned; input order breaks ties so plans are stable.
        while plan.len() < self.artifacts.len() {
            let mut progressed = false;
            for artifact in &self.artifacts {
                if planned.contains(artifact.id.as_str()) {
                    continue;
                }
                let ready = artifact
                    .depends_on
                    .iter()
                    .filter(|dep| requested.contains(dep.as_str()))
                    .all(|dep| planned.contains(dep.as_str()));
                if ready {
                    planned.insert(artifact.id.as_str());
                    plan.push(artifact);
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = self
                    .artifacts
                    .iter()
                    .filter(|artifact| !planned.contains(artifact.id.as_str()))
                    .map(|artifact| artifact.id.as_str())
                    .collect();
                return Err(EngineError::Configuration(format!(
                    "channel dependency cycle involving: {}",
                    stuck.join(", ")
                )));
            }
        }
        Ok(plan)
    }
}
