use std::collections::{HashMap, HashSet};

use crate::connections::ConnectionId;

/// Channel-scoped subscriber groups.
///
/// Fan-out goes through [`Topics::snapshot_except`] and [`Topics::clear`], which copy the member
/// list so the caller can deliver without holding on to the set.
#[derive(Debug, Default)]
pub struct Topics {
    members: HashMap<String, HashSet<ConnectionId>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the connection was not already subscribed.
    pub fn subscribe(&mut self, topic: &str, connection_id: &str) -> bool {
        self.members
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string())
    }

    /// Returns `true` if the connection was subscribed. Empty topics are dropped.
    pub fn unsubscribe(&mut self, topic: &str, connection_id: &str) -> bool {
        let Some(members) = self.members.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(connection_id);
        if members.is_empty() {
            self.members.remove(topic);
        }
        removed
    }

    pub fn contains(&self, topic: &str, connection_id: &str) -> bool {
        self.members
            .get(topic)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, topic: &str) -> Vec<ConnectionId> {
        self.members
            .get(topic)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot_except(&self, topic: &str, excluded: &str) -> Vec<ConnectionId> {
        self.members
            .get(topic)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| id.as_str() != excluded)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the whole topic, returning its former members.
    pub fn clear(&mut self, topic: &str) -> Vec<ConnectionId> {
        self.members
            .remove(topic)
            .map(|members| members.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop a connection from every topic it belongs to, returning the affected topic names.
    pub fn remove_everywhere(&mut self, connection_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        self.members.retain(|topic, members| {
            if members.remove(connection_id) {
                affected.push(topic.clone());
            }
            !members.is_empty()
        });
        affected
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.members.get(topic).map(HashSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut ids: Vec<ConnectionId>) -> Vec<ConnectionId> {
        ids.sort();
        ids
    }

    #[test_timeout::timeout]
    fn test_subscribe_is_idempotent() {
        let mut topics = Topics::new();
        assert!(topics.subscribe("m1", "a"));
        assert!(!topics.subscribe("m1", "a"));
        assert_eq!(topics.member_count("m1"), 1);
    }

    #[test_timeout::timeout]
    fn test_unsubscribe_drops_empty_topic() {
        let mut topics = Topics::new();
        topics.subscribe("m1", "a");
        assert!(topics.unsubscribe("m1", "a"));
        assert!(!topics.unsubscribe("m1", "a"));
        assert_eq!(topics.member_count("m1"), 0);
        assert!(topics.members.is_empty());
    }

    #[test_timeout::timeout]
    fn test_snapshot_except_skips_sender() {
        let mut topics = Topics::new();
        for id in ["a", "b", "c"] {
            topics.subscribe("m1", id);
        }
        assert_eq!(
            sorted(topics.snapshot_except("m1", "a")),
            vec!["b".to_string(), "c".to_string()]
        );
        assert!(topics.snapshot_except("unknown", "a").is_empty());
    }

    #[test_timeout::timeout]
    fn test_snapshot_is_detached_from_later_changes() {
        let mut topics = Topics::new();
        topics.subscribe("m1", "a");
        topics.subscribe("m1", "b");
        let snapshot = topics.snapshot("m1");
        topics.unsubscribe("m1", "b");
        topics.subscribe("m1", "c");
        assert_eq!(sorted(snapshot), vec!["a".to_string(), "b".to_string()]);
    }

    #[test_timeout::timeout]
    fn test_remove_everywhere_reports_topics() {
        let mut topics = Topics::new();
        topics.subscribe("m1", "a");
        topics.subscribe("m2", "a");
        topics.subscribe("m2", "b");
        let mut affected = topics.remove_everywhere("a");
        affected.sort();
        assert_eq!(affected, vec!["m1".to_string(), "m2".to_string()]);
        assert!(!topics.contains("m2", "a"));
        assert!(topics.contains("m2", "b"));
        assert_eq!(topics.member_count("m1"), 0);
    }

    #[test_timeout::timeout]
    fn test_clear_returns_members() {
        let mut topics = Topics::new();
        topics.subscribe("m1", "a");
        topics.subscribe("m1", "b");
        assert_eq!(
            sorted(topics.clear("m1")),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(topics.clear("m1").is_empty());
    }
}
