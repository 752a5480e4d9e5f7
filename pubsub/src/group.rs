//! Named groups of topic patterns.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::topic;

/// A named, ordered set of unique topic patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGroup {
    name: String,
    description: Option<String>,
    topics: Vec<String>,
}

impl TopicGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            topics: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Patterns in insertion order.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Add a pattern. Returns `Ok(false)` if it is already a member.
    pub fn add_topic(&mut self, pattern: &str) -> Result<bool> {
        if pattern.is_empty() {
            return Err(Error::InvalidTopicPattern(pattern.to_string()));
        }
        if self.contains(pattern) {
            return Ok(false);
        }
        self.topics.push(pattern.to_string());
        Ok(true)
    }

    /// Remove a pattern. Returns whether it was a member.
    pub fn remove_topic(&mut self, pattern: &str) -> bool {
        let before = self.topics.len();
        self.topics.retain(|t| t != pattern);
        self.topics.len() != before
    }

    /// Exact membership test, no wildcard evaluation.
    pub fn contains(&self, pattern: &str) -> bool {
        self.topics.iter().any(|t| t == pattern)
    }

    /// Reports whether any member pattern matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|p| topic::is_match(topic, p))
    }
}

/// In-memory registry of topic groups.
///
/// Lookups return snapshots; use the manager's mutators to change a group.
#[derive(Debug, Default)]
pub struct TopicGroupManager {
    groups: RwLock<HashMap<String, TopicGroup>>,
}

impl TopicGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group. Fails with [`Error::DuplicateGroup`] if the name is taken.
    pub fn create_group<I, S>(
        &self,
        name: &str,
        description: Option<&str>,
        initial_topics: I,
    ) -> Result<TopicGroup>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut group = TopicGroup::new(name);
        if let Some(description) = description {
            group = group.with_description(description);
        }
        for pattern in initial_topics {
            group.add_topic(pattern.as_ref())?;
        }

        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(Error::DuplicateGroup(name.to_string()));
        }
        groups.insert(name.to_string(), group.clone());
        Ok(group)
    }

    pub fn get_group(&self, name: &str) -> Option<TopicGroup> {
        self.groups.read().get(name).cloned()
    }

    pub fn remove_group(&self, name: &str) -> bool {
        self.groups.write().remove(name).is_some()
    }

    /// Add a pattern to a group. Returns `Ok(false)` if already present.
    pub fn add_topic(&self, group: &str, pattern: &str) -> Result<bool> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        group.add_topic(pattern)
    }

    /// Remove a pattern from a group. Returns whether it was present.
    pub fn remove_topic(&self, group: &str, pattern: &str) -> Result<bool> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        Ok(group.remove_topic(pattern))
    }

    /// All groups, sorted by name.
    pub fn groups(&self) -> Vec<TopicGroup> {
        let mut groups: Vec<TopicGroup> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Groups whose pattern set literally contains `topic`.
    pub fn find_groups_containing_topic(&self, topic: &str) -> Vec<TopicGroup> {
        self.collect_sorted(|g| g.contains(topic))
    }

    /// Groups with at least one pattern that wildcard-matches `topic`.
    pub fn find_matching_groups(&self, topic: &str) -> Vec<TopicGroup> {
        self.collect_sorted(|g| g.matches(topic))
    }

    fn collect_sorted(&self, pred: impl Fn(&TopicGroup) -> bool) -> Vec<TopicGroup> {
        let mut found: Vec<TopicGroup> = self
            .groups
            .read()
            .values()
            .filter(|g| pred(g))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}
