use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::fleet::selection::{AffinityMode, AffinityTarget};
use crate::scheduler::Job;

/// Binds a workflow to a robot. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotAssignment {
    pub workflow_id: String,
    pub robot_id: String,
    pub is_default: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl RobotAssignment {
    pub fn new(
        workflow_id: impl Into<String>,
        robot_id: impl Into<String>,
        is_default: bool,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let assignment = Self {
            workflow_id: workflow_id.into(),
            robot_id: robot_id.into(),
            is_default,
            priority,
            created_at,
        };
        validate_ids(&assignment.workflow_id, &assignment.robot_id)?;
        Ok(assignment)
    }
}

/// Routes one node of a workflow to a specific robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRobotOverride {
    pub workflow_id: String,
    pub node_id: String,
    pub robot_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl NodeRobotOverride {
    pub fn new(
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
        robot_id: impl Into<String>,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let node_override = Self {
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            robot_id: robot_id.into(),
            priority,
            created_at,
        };
        validate_ids(&node_override.workflow_id, &node_override.robot_id)?;
        if node_override.node_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidAssignment(
                "node_id cannot be empty".to_string(),
            ));
        }
        Ok(node_override)
    }
}

fn validate_ids(workflow_id: &str, robot_id: &str) -> Result<()> {
    if workflow_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidAssignment(
            "workflow_id cannot be empty".to_string(),
        ));
    }
    if robot_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidAssignment(
            "robot_id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Where routing rules point a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingSource {
    NodeOverride,
    WorkflowDefault,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentStore {
    assignments: HashMap<String, Vec<RobotAssignment>>,
    node_overrides: HashMap<(String, String), NodeRobotOverride>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assignment. A workflow holds at most one entry per robot and
    /// at most one default.
    pub fn assign(&mut self, assignment: RobotAssignment) -> Result<()> {
        let entries = self
            .assignments
            .entry(assignment.workflow_id.clone())
            .or_default();

        if entries.iter().any(|a| a.robot_id == assignment.robot_id) {
            return Err(OrchestratorError::DuplicateAssignment(format!(
                "workflow {} is already assigned to robot {}",
                assignment.workflow_id, assignment.robot_id
            )));
        }
        if assignment.is_default && entries.iter().any(|a| a.is_default) {
            return Err(OrchestratorError::DuplicateAssignment(format!(
                "workflow {} already has a default robot",
                assignment.workflow_id
            )));
        }
        tracing::info!(
            workflow_id = %assignment.workflow_id,
            robot_id = %assignment.robot_id,
            is_default = assignment.is_default,
            "Robot assignment added"
        );
        entries.push(assignment);
        Ok(())
    }

    /// Makes `assignment` the workflow's only default, replacing any previous
    /// default and any entry for the same robot.
    pub fn set_default(&mut self, assignment: RobotAssignment) -> Result<()> {
        if !assignment.is_default {
            return Err(OrchestratorError::InvalidAssignment(
                "set_default needs an assignment with is_default = true".to_string(),
            ));
        }
        if let Some(entries) = self.assignments.get_mut(&assignment.workflow_id) {
            entries.retain(|a| !a.is_default && a.robot_id != assignment.robot_id);
        }
        self.assign(assignment)
    }

    /// Returns true if something was removed.
    pub fn unassign(&mut self, workflow_id: &str, robot_id: &str) -> bool {
        let Some(entries) = self.assignments.get_mut(workflow_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|a| a.robot_id != robot_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.assignments.remove(workflow_id);
        }
        removed
    }

    pub fn default_for(&self, workflow_id: &str) -> Option<&RobotAssignment> {
        self.assignments
            .get(workflow_id)
            .and_then(|entries| entries.iter().find(|a| a.is_default))
    }

    /// Highest priority first.
    pub fn assignments_for(&self, workflow_id: &str) -> Vec<RobotAssignment> {
        let mut entries = self
            .assignments
            .get(workflow_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries
    }

    /// Inserts or replaces the override for `(workflow_id, node_id)`.
    pub fn set_node_override(&mut self, node_override: NodeRobotOverride) {
        tracing::info!(
            workflow_id = %node_override.workflow_id,
            node_id = %node_override.node_id,
            robot_id = %node_override.robot_id,
            "Node override set"
        );
        self.node_overrides.insert(
            (
                node_override.workflow_id.clone(),
                node_override.node_id.clone(),
            ),
            node_override,
        );
    }

    pub fn remove_node_override(&mut self, workflow_id: &str, node_id: &str) -> bool {
        self.node_overrides
            .remove(&(workflow_id.to_string(), node_id.to_string()))
            .is_some()
    }

    pub fn node_override(&self, workflow_id: &str, node_id: &str) -> Option<&NodeRobotOverride> {
        self.node_overrides
            .get(&(workflow_id.to_string(), node_id.to_string()))
    }

    /// Robot the routing rules pin this job to, if any. Node overrides win
    /// over the workflow default.
    pub fn resolve(&self, workflow_id: &str, node_id: Option<&str>) -> Option<(String, RoutingSource)> {
        if let Some(found) = node_id.and_then(|node| self.node_override(workflow_id, node)) {
            return Some((found.robot_id.clone(), RoutingSource::NodeOverride));
        }
        self.default_for(workflow_id)
            .map(|a| (a.robot_id.clone(), RoutingSource::WorkflowDefault))
    }

    /// Node override, then workflow default, then (session mode only) the
    /// robot that ran the previous attempt.
    pub fn affinity_for(&self, job: &Job, mode: AffinityMode) -> Option<AffinityTarget> {
        if let Some((robot_id, source)) = self.resolve(&job.workflow_id, job.node_id.as_deref()) {
            tracing::debug!(job_id = %job.id, robot_id = %robot_id, ?source, "Routing rule applies");
            return Some(AffinityTarget::new(robot_id, mode));
        }
        match (mode, &job.last_robot_id) {
            (AffinityMode::Session, Some(previous)) => {
                Some(AffinityTarget::new(previous.clone(), AffinityMode::Session))
            }
            _ => None,
        }
    }
}
