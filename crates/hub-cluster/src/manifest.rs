use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use hub_types::{HubError, ProjectId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Input,
    Output,
    Ruleset,
    Plugin,
    Project,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Input => "input",
            ComponentKind::Output => "output",
            ComponentKind::Ruleset => "ruleset",
            ComponentKind::Plugin => "plugin",
            ComponentKind::Project => "project",
        }
    }
}

impl FromStr for ComponentKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(ComponentKind::Input),
            "output" => Ok(ComponentKind::Output),
            "ruleset" => Ok(ComponentKind::Ruleset),
            "plugin" => Ok(ComponentKind::Plugin),
            "project" => Ok(ComponentKind::Project),
            other => Err(HubError::InvalidArgument(format!("unknown component kind '{other}'"))),
        }
    }
}

/// `kind:id`, e.g. `ruleset:r1`. Doubles as the distributed lock name.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ComponentKey {
    pub kind: ComponentKind,
    pub id: String,
}

impl ComponentKey {
    pub fn new(kind: ComponentKind, id: impl Into<String>) -> Self {
        ComponentKey { kind, id: id.into() }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for ComponentKey {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| HubError::InvalidArgument(format!("invalid component reference '{s}'")))?;
        if id.is_empty() {
            return Err(HubError::InvalidArgument(format!("empty component id in '{s}'")));
        }
        Ok(ComponentKey { kind: kind.parse()?, id: id.to_string() })
    }
}

/// Desired shape of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectManifest {
    pub components: BTreeSet<ComponentKey>,
    /// Whether the operator wants the project running.
    pub desired: bool,
    /// Bumped on every restart request so the engine can tell a restart
    /// apart from an unchanged snapshot.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// One requested component change.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ComponentChange {
    pub kind: ChangeKind,
    pub component: ComponentKey,
    /// Raw component definition. For projects: component references
    /// (`kind:id`) separated by commas or whitespace.
    pub content: Option<String>,
}

impl ComponentChange {
    pub fn add(component: ComponentKey, content: impl Into<String>) -> Self {
        ComponentChange { kind: ChangeKind::Add, component, content: Some(content.into()) }
    }

    pub fn update(component: ComponentKey, content: impl Into<String>) -> Self {
        ComponentChange { kind: ChangeKind::Update, component, content: Some(content.into()) }
    }

    pub fn delete(component: ComponentKey) -> Self {
        ComponentChange { kind: ChangeKind::Delete, component, content: None }
    }
}

/// Full declarative cluster configuration. Every instruction carries one, so
/// a follower can always converge from the latest instruction alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterManifest {
    pub components: BTreeMap<ComponentKey, String>,
    pub projects: BTreeMap<ProjectId, ProjectManifest>,
}

fn parse_project_refs(content: &str) -> Result<BTreeSet<ComponentKey>, HubError> {
    content
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            let key: ComponentKey = s.parse()?;
            if key.kind == ComponentKind::Project {
                return Err(HubError::InvalidArgument(format!("project cannot reference '{key}'")));
            }
            Ok(key)
        })
        .collect()
}

impl ClusterManifest {
    /// Projects that reference `component`, sorted.
    pub fn projects_using(&self, component: &ComponentKey) -> Vec<ProjectId> {
        if component.kind == ComponentKind::Project {
            return if self.projects.contains_key(&component.id) {
                vec![component.id.clone()]
            } else {
                Vec::new()
            };
        }
        self.projects
            .iter()
            .filter(|(_, p)| p.components.contains(component))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn exists(&self, component: &ComponentKey) -> bool {
        match component.kind {
            ComponentKind::Project => self.projects.contains_key(&component.id),
            _ => self.components.contains_key(component),
        }
    }

    /// Apply `change` in place. Returns the affected projects.
    pub fn apply_change(&mut self, change: &ComponentChange) -> Result<Vec<ProjectId>, HubError> {
        let key = &change.component;
        let exists = self.exists(key);
        match change.kind {
            ChangeKind::Add if exists => {
                return Err(HubError::InvalidArgument(format!("component '{key}' already exists")))
            }
            ChangeKind::Update | ChangeKind::Delete if !exists => {
                return Err(HubError::InvalidArgument(format!("component '{key}' does not exist")))
            }
            _ => {}
        }

        if change.kind == ChangeKind::Delete {
            let affected = self.projects_using(key);
            if key.kind == ComponentKind::Project {
                self.projects.remove(&key.id);
            } else {
                if !affected.is_empty() {
                    return Err(HubError::InvalidArgument(format!(
                        "component '{key}' is referenced by projects {affected:?}"
                    )));
                }
                self.components.remove(key);
            }
            return Ok(affected);
        }

        let content = change
            .content
            .as_deref()
            .ok_or_else(|| HubError::InvalidArgument(format!("missing content for '{key}'")))?;

        if key.kind == ComponentKind::Project {
            let components = parse_project_refs(content)?;
            let project = self.projects.entry(key.id.clone()).or_default();
            project.components = components;
            Ok(vec![key.id.clone()])
        } else {
            self.components.insert(key.clone(), content.to_string());
            Ok(self.projects_using(key))
        }
    }

    /// Set the desired running state of an existing project.
    pub fn set_desired(&mut self, project_id: &str, desired: bool) -> Result<(), HubError> {
        self.project_mut(project_id)?.desired = desired;
        Ok(())
    }

    /// Request a restart: project is set to run and its generation bumped.
    pub fn restart(&mut self, project_id: &str) -> Result<u64, HubError> {
        let project = self.project_mut(project_id)?;
        project.desired = true;
        project.generation += 1;
        Ok(project.generation)
    }

    fn project_mut(&mut self, project_id: &str) -> Result<&mut ProjectManifest, HubError> {
        self.projects
            .get_mut(project_id)
            .ok_or_else(|| HubError::InvalidArgument(format!("project '{project_id}' does not exist")))
    }

    /// Component references of `project_id` that are not defined.
    pub fn missing_components(&self, project_id: &str) -> Vec<ComponentKey> {
        self.projects
            .get(project_id)
            .map(|p| {
                p.components
                    .iter()
                    .filter(|c| !self.components.contains_key(*c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset(id: &str) -> ComponentKey {
        ComponentKey::new(ComponentKind::Ruleset, id)
    }

    fn project(id: &str) -> ComponentKey {
        ComponentKey::new(ComponentKind::Project, id)
    }

    #[test]
    fn component_key_round_trips() {
        let key: ComponentKey = "ruleset:r1".parse().unwrap();
        assert_eq!(key, ruleset("r1"));
        assert_eq!(key.to_string(), "ruleset:r1");
        assert!("ruleset".parse::<ComponentKey>().is_err());
        assert!("widget:w".parse::<ComponentKey>().is_err());
        assert!("input:".parse::<ComponentKey>().is_err());
    }

    #[test]
    fn add_update_delete_component() {
        let mut m = ClusterManifest::default();
        m.apply_change(&ComponentChange::add(ruleset("r1"), "v1")).unwrap();
        assert!(m.apply_change(&ComponentChange::add(ruleset("r1"), "v1")).is_err());

        m.apply_change(&ComponentChange::update(ruleset("r1"), "v2")).unwrap();
        assert_eq!(m.components[&ruleset("r1")], "v2");

        m.apply_change(&ComponentChange::delete(ruleset("r1"))).unwrap();
        assert!(m.components.is_empty());
        assert!(m.apply_change(&ComponentChange::update(ruleset("r1"), "v3")).is_err());
    }

    #[test]
    fn affected_projects_follow_references() {
        let mut m = ClusterManifest::default();
        m.apply_change(&ComponentChange::add(ruleset("r1"), "rules")).unwrap();
        m.apply_change(&ComponentChange::add(project("p1"), "ruleset:r1, input:i1")).unwrap();
        m.apply_change(&ComponentChange::add(project("p2"), "output:o1")).unwrap();

        let affected = m.apply_change(&ComponentChange::update(ruleset("r1"), "rules2")).unwrap();
        assert_eq!(affected, vec!["p1".to_string()]);
        assert_eq!(m.missing_components("p1"), vec!["input:i1".parse().unwrap()]);
    }

    #[test]
    fn referenced_component_cannot_be_deleted() {
        let mut m = ClusterManifest::default();
        m.apply_change(&ComponentChange::add(ruleset("r1"), "rules")).unwrap();
        m.apply_change(&ComponentChange::add(project("p1"), "ruleset:r1")).unwrap();

        let err = m.apply_change(&ComponentChange::delete(ruleset("r1"))).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let affected = m.apply_change(&ComponentChange::delete(project("p1"))).unwrap();
        assert_eq!(affected, vec!["p1".to_string()]);
        m.apply_change(&ComponentChange::delete(ruleset("r1"))).unwrap();
    }

    #[test]
    fn project_update_keeps_desired_state() {
        let mut m = ClusterManifest::default();
        m.apply_change(&ComponentChange::add(project("p1"), "input:i1")).unwrap();
        m.set_desired("p1", true).unwrap();
        m.apply_change(&ComponentChange::update(project("p1"), "input:i1 output:o1")).unwrap();

        let p = &m.projects["p1"];
        assert!(p.desired);
        assert_eq!(p.components.len(), 2);
    }

    #[test]
    fn restart_bumps_generation() {
        let mut m = ClusterManifest::default();
        m.apply_change(&ComponentChange::add(project("p1"), "input:i1")).unwrap();
        assert_eq!(m.restart("p1").unwrap(), 1);
        assert_eq!(m.restart("p1").unwrap(), 2);
        assert!(m.projects["p1"].desired);
        assert!(m.restart("missing").is_err());
    }
}
