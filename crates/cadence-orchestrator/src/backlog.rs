use crate::types::{Story, StoryStatus};
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// The set of stories the orchestrator works through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub stories: Vec<Story>,
}

impl Backlog {
    pub fn new(stories: Vec<Story>) -> Self {
        Self { stories }
    }

    /// Parse a TOML backlog (`[[stories]]` tables).
    pub fn from_toml_str(raw: &str) -> CadenceResult<Self> {
        let backlog: Backlog = toml::from_str(raw)
            .map_err(|e| CadenceError::Config(format!("Failed to parse backlog: {e}")))?;
        backlog.validate_ids()?;
        Ok(backlog)
    }

    /// Parse a JSON backlog (`{"stories": [...]}`).
    pub fn from_json_str(raw: &str) -> CadenceResult<Self> {
        let backlog: Backlog = serde_json::from_str(raw)
            .map_err(|e| CadenceError::Config(format!("Failed to parse backlog: {e}")))?;
        backlog.validate_ids()?;
        Ok(backlog)
    }

    /// Load a backlog file; `.json` is parsed as JSON, anything else as TOML.
    pub async fn load(path: &Path) -> CadenceResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CadenceError::Config(format!(
                "Failed to read backlog '{}': {}",
                path.display(),
                e
            ))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_toml_str(&raw),
        }
    }

    fn validate_ids(&self) -> CadenceResult<()> {
        let mut seen = HashSet::new();
        for story in &self.stories {
            if story.id.trim().is_empty() {
                return Err(CadenceError::Config("story with empty id".into()));
            }
            if !seen.insert(story.id.as_str()) {
                return Err(CadenceError::Config(format!(
                    "duplicate story id '{}'",
                    story.id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StoryStatus> {
        self.get(id).map(|s| s.status)
    }

    /// Update a story's status.
    pub fn set_status(&mut self, id: &str, status: StoryStatus) -> CadenceResult<()> {
        let story = self
            .get_mut(id)
            .ok_or_else(|| CadenceError::StoryNotFound(id.to_string()))?;
        story.status = status;
        Ok(())
    }

    /// Stories the orchestrator still has to admit.
    pub fn awaiting_admission(&self) -> Vec<&Story> {
        self.stories
            .iter()
            .filter(|s| matches!(s.status, StoryStatus::Backlog | StoryStatus::Cleared))
            .collect()
    }

    /// Add stories from a freshly loaded backlog that this one does not know.
    ///
    /// Known stories keep their persisted status. Returns how many were added.
    pub fn merge_new(&mut self, incoming: Backlog) -> usize {
        let mut added = 0;
        for story in incoming.stories {
            if self.get(&story.id).is_none() {
                self.stories.push(story);
                added += 1;
            }
        }
        added
    }

    /// Whether every story reached a state with no further scheduling work.
    pub fn is_settled(&self) -> bool {
        self.stories.iter().all(|s| s.status.is_settled())
    }

    pub fn count(&self, status: StoryStatus) -> usize {
        self.stories.iter().filter(|s| s.status == status).count()
    }

    /// The dependency cycle `id` sits on, as a path that starts and ends at `id`.
    ///
    /// Self-dependencies and edges into done or cancelled stories are skipped;
    /// readiness reports those separately.
    pub fn dependency_cycle(&self, id: &str) -> Option<Vec<String>> {
        let mut path = vec![id.to_string()];
        let mut visited = HashSet::new();
        self.path_back_to(id, id, &mut path, &mut visited)
            .then_some(path)
    }

    fn path_back_to<'a>(
        &'a self,
        target: &str,
        current: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        let Some(story) = self.get(current) else {
            return false;
        };
        for dep in &story.depends_on {
            if dep == current
                || matches!(
                    self.status_of(dep),
                    None | Some(StoryStatus::Done | StoryStatus::Cancelled)
                )
            {
                continue;
            }
            path.push(dep.clone());
            if dep == target {
                return true;
            }
            if visited.insert(dep.as_str()) && self.path_back_to(target, dep, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Priority;

    const SAMPLE: &str = r#"
[[stories]]
id = "S-1"
title = "Why Rust for pipelines"
priority = "P0"
size = 3
acceptance_criteria = ["cites two sources", "under 1500 words", "has a hero image"]
requires_graphics = true

[[stories]]
id = "S-2"
title = "Follow-up FAQ"
priority = "P2"
size = 2
acceptance_criteria = ["five questions", "links to S-1", "plain language"]
depends_on = ["S-1"]
"#;

    #[test]
    fn test_parse_toml_backlog() {
        let backlog = Backlog::from_toml_str(SAMPLE).unwrap();
        assert_eq!(backlog.stories.len(), 2);
        let s1 = backlog.get("S-1").unwrap();
        assert_eq!(s1.priority, Some(Priority::P0));
        assert!(s1.requires_graphics);
        assert_eq!(s1.status, StoryStatus::Backlog);
        assert_eq!(backlog.get("S-2").unwrap().depends_on, vec!["S-1"]);
    }

    #[test]
    fn test_parse_json_backlog_with_missing_fields() {
        let raw = r#"{"stories":[{"id":"S-9","title":"Draft"}]}"#;
        let backlog = Backlog::from_json_str(raw).unwrap();
        let story = backlog.get("S-9").unwrap();
        assert!(story.priority.is_none());
        assert!(story.size.is_none());
        assert!(story.acceptance_criteria.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let raw = r#"{"stories":[{"id":"S-1"},{"id":"S-1"}]}"#;
        let err = Backlog::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate story id"));
    }

    #[test]
    fn test_merge_keeps_persisted_status() {
        let mut persisted = Backlog::from_toml_str(SAMPLE).unwrap();
        persisted.set_status("S-1", StoryStatus::Done).unwrap();

        let mut incoming = Backlog::from_toml_str(SAMPLE).unwrap();
        incoming.stories.push(Story::new("S-3", "New one"));

        assert_eq!(persisted.merge_new(incoming), 1);
        assert_eq!(persisted.status_of("S-1"), Some(StoryStatus::Done));
        assert_eq!(persisted.stories.len(), 3);
    }

    #[test]
    fn test_settled() {
        let mut backlog = Backlog::from_toml_str(SAMPLE).unwrap();
        assert!(!backlog.is_settled());
        backlog.set_status("S-1", StoryStatus::Done).unwrap();
        backlog.set_status("S-2", StoryStatus::NotReady).unwrap();
        assert!(backlog.is_settled());
        assert!(backlog.set_status("S-404", StoryStatus::Done).is_err());
    }

    #[test]
    fn test_dependency_cycle_path() {
        let backlog = Backlog::new(vec![
            Story::new("S-1", "a").depending_on("S-3"),
            Story::new("S-2", "b").depending_on("S-1"),
            Story::new("S-3", "c").depending_on("S-2"),
            Story::new("S-4", "d").depending_on("S-1"),
            Story::new("S-5", "e").depending_on("S-5"),
        ]);
        assert_eq!(
            backlog.dependency_cycle("S-1").unwrap(),
            vec!["S-1", "S-3", "S-2", "S-1"]
        );
        // Downstream of a cycle, but not on it.
        assert!(backlog.dependency_cycle("S-4").is_none());
        assert!(backlog.dependency_cycle("S-5").is_none());
    }

    #[test]
    fn test_finished_story_breaks_cycle() {
        let mut backlog = Backlog::new(vec![
            Story::new("S-1", "a").depending_on("S-2"),
            Story::new("S-2", "b").depending_on("S-1"),
        ]);
        assert!(backlog.dependency_cycle("S-2").is_some());
        backlog.set_status("S-1", StoryStatus::Done).unwrap();
        assert!(backlog.dependency_cycle("S-2").is_none());
    }

    #[tokio::test]
    async fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("backlog.toml");
        tokio::fs::write(&toml_path, SAMPLE).await.unwrap();
        assert_eq!(Backlog::load(&toml_path).await.unwrap().stories.len(), 2);

        let json_path = dir.path().join("backlog.json");
        tokio::fs::write(&json_path, r#"{"stories":[{"id":"S-1"}]}"#)
            .await
            .unwrap();
        assert_eq!(Backlog::load(&json_path).await.unwrap().stories.len(), 1);

        let missing = Backlog::load(&dir.path().join("nope.toml")).await;
        assert!(missing.is_err());
    }
}
