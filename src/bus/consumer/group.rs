use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::warn;

use crate::bus::broker::types::{GroupInfo, TopicPartition};
use crate::storage::OffsetSnapshot;

#[derive(Debug, Clone)]
pub struct GroupMember {
    pub member_id: String,
    pub client_id: String,
    pub subscriptions: BTreeSet<String>,
    pub join_time: DateTime<Utc>,
}

/// Membership, assignment and committed offsets of one consumer group.
#[derive(Debug, Clone, Default)]
pub struct ConsumerGroup {
    pub group_id: String,
    /// Keyed (and therefore sorted) by member id.
    pub members: BTreeMap<String, GroupMember>,
    pub generation: i32,
    /// Partition -> owning member.
    pub assignment: BTreeMap<TopicPartition, String>,
    /// Partition -> next offset to read.
    pub offsets: OffsetSnapshot,
}

impl ConsumerGroup {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn has_member(&self, member_id: &str) -> bool {
        self.members.contains_key(member_id)
    }

    /// Adds a member, or merges new subscriptions into an existing one.
    /// Returns true when membership or subscriptions changed.
    pub fn upsert_member(&mut self, member_id: &str, client_id: &str, topics: &[String]) -> bool {
        match self.members.get_mut(member_id) {
            Some(member) => {
                let before = member.subscriptions.len();
                member.subscriptions.extend(topics.iter().cloned());
                member.subscriptions.len() != before
            }
            None => {
                self.members.insert(
                    member_id.to_string(),
                    GroupMember {
                        member_id: member_id.to_string(),
                        client_id: client_id.to_string(),
                        subscriptions: topics.iter().cloned().collect(),
                        join_time: Utc::now(),
                    },
                );
                true
            }
        }
    }

    pub fn remove_member(&mut self, member_id: &str) -> Option<GroupMember> {
        self.members.remove(member_id)
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|member| member.subscriptions.iter().cloned())
            .collect()
    }

    /// Recomputes the assignment from scratch and bumps the generation.
    ///
    /// Partitions of every subscribed topic are sorted by (topic, partition)
    /// and dealt out round-robin over the members in member id order. A member
    /// only receives partitions of topics it subscribed to; when every member
    /// shares the same subscriptions this is plain round-robin. Not sticky:
    /// partitions may move on every membership change.
    pub fn rebalance(&mut self, partition_count: impl Fn(&str) -> Option<i32>) {
        let mut partitions = BTreeMap::new();
        for topic in self.subscribed_topics() {
            match partition_count(&topic) {
                Some(count) => {
                    partitions.insert(topic, count);
                }
                None => warn!(
                    "Topic {} subscribed by group {} does not exist, skipping",
                    topic, self.group_id
                ),
            }
        }
        let subscriptions: BTreeMap<String, BTreeSet<String>> = self
            .members
            .iter()
            .map(|(id, member)| (id.clone(), member.subscriptions.clone()))
            .collect();

        self.assignment = assign_round_robin(&subscriptions, &partitions);
        self.generation += 1;
    }

    /// Drops every assignment; used when the last member leaves. Offsets are kept.
    pub fn clear_assignment(&mut self) {
        self.assignment.clear();
        self.generation += 1;
    }

    pub fn assignment_for(&self, member_id: &str) -> Vec<TopicPartition> {
        self.assignment
            .iter()
            .filter(|(_, owner)| owner.as_str() == member_id)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    pub fn owner(&self, tp: &TopicPartition) -> Option<&str> {
        self.assignment.get(tp).map(String::as_str)
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.get(tp).copied()
    }

    pub fn info(&self) -> GroupInfo {
        let mut assignment: BTreeMap<String, Vec<TopicPartition>> = self
            .members
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        for (tp, owner) in &self.assignment {
            assignment.entry(owner.clone()).or_default().push(tp.clone());
        }
        GroupInfo {
            group_id: self.group_id.clone(),
            generation: self.generation,
            member_count: self.members.len(),
            members: self.members.keys().cloned().collect(),
            assignment,
            offsets: self.offsets.clone(),
        }
    }
}

/// Deals `(topic, partition)` pairs to members in sorted order, skipping
/// members that are not subscribed to the pair's topic.
pub fn assign_round_robin(
    subscriptions: &BTreeMap<String, BTreeSet<String>>,
    partitions: &BTreeMap<String, i32>,
) -> BTreeMap<TopicPartition, String> {
    let members: Vec<(&String, &BTreeSet<String>)> = subscriptions.iter().collect();
    let mut assignment = BTreeMap::new();
    if members.is_empty() {
        return assignment;
    }

    let mut cursor = 0;
    for (topic, &count) in partitions {
        for partition in 0..count {
            let owner = (0..members.len())
                .map(|step| (cursor + step) % members.len())
                .find(|&idx| members[idx].1.contains(topic));
            if let Some(idx) = owner {
                assignment.insert(TopicPartition::new(topic.clone(), partition), members[idx].0.clone());
                cursor = (idx + 1) % members.len();
            }
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs(entries: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(member, topics)| {
                (
                    member.to_string(),
                    topics.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect()
    }

    fn counts(entries: &[(&str, i32)]) -> BTreeMap<String, i32> {
        entries.iter().map(|(t, c)| (t.to_string(), *c)).collect()
    }

    #[test]
    fn test_two_members_split_four_partitions() {
        let assignment = assign_round_robin(
            &subs(&[("m-1", &["orders"]), ("m-2", &["orders"])]),
            &counts(&[("orders", 4)]),
        );
        assert_eq!(assignment.len(), 4);
        assert_eq!(assignment[&TopicPartition::new("orders", 0)], "m-1");
        assert_eq!(assignment[&TopicPartition::new("orders", 1)], "m-2");
        assert_eq!(assignment[&TopicPartition::new("orders", 2)], "m-1");
        assert_eq!(assignment[&TopicPartition::new("orders", 3)], "m-2");
    }

    #[test]
    fn test_round_robin_continues_across_topics() {
        let assignment = assign_round_robin(
            &subs(&[("a", &["x", "y"]), ("b", &["x", "y"]), ("c", &["x", "y"])]),
            &counts(&[("x", 2), ("y", 2)]),
        );
        let owners: Vec<&str> = assignment.values().map(String::as_str).collect();
        assert_eq!(owners, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_unsubscribed_members_are_skipped() {
        let assignment = assign_round_robin(
            &subs(&[("a", &["x"]), ("b", &["y"])]),
            &counts(&[("x", 3), ("y", 1)]),
        );
        for partition in 0..3 {
            assert_eq!(assignment[&TopicPartition::new("x", partition)], "a");
        }
        assert_eq!(assignment[&TopicPartition::new("y", 0)], "b");
    }

    #[test]
    fn test_deterministic() {
        let members = subs(&[("b", &["t"]), ("a", &["t"]), ("c", &["t"])]);
        let partitions = counts(&[("t", 5)]);
        assert_eq!(
            assign_round_robin(&members, &partitions),
            assign_round_robin(&members, &partitions)
        );
    }

    #[test]
    fn test_group_rebalance_and_leave() {
        let mut group = ConsumerGroup::new("g1");
        group.upsert_member("m-1", "c", &["orders".to_string()]);
        group.upsert_member("m-2", "c", &["orders".to_string()]);
        group.rebalance(|_| Some(4));
        assert_eq!(group.generation, 1);
        assert_eq!(group.assignment_for("m-1").len(), 2);
        assert_eq!(group.assignment_for("m-2").len(), 2);

        group.remove_member("m-1");
        group.rebalance(|_| Some(4));
        assert_eq!(group.generation, 2);
        assert_eq!(group.assignment_for("m-2").len(), 4);
        assert!(group.assignment_for("m-1").is_empty());
    }

    #[test]
    fn test_missing_topic_is_skipped() {
        let mut group = ConsumerGroup::new("g1");
        group.upsert_member("m-1", "c", &["gone".to_string(), "here".to_string()]);
        group.rebalance(|topic| (topic == "here").then_some(2));
        assert_eq!(group.assignment.len(), 2);
    }

    #[test]
    fn test_upsert_reports_changes() {
        let mut group = ConsumerGroup::new("g1");
        assert!(group.upsert_member("m-1", "c", &["a".to_string()]));
        assert!(!group.upsert_member("m-1", "c", &["a".to_string()]));
        assert!(group.upsert_member("m-1", "c", &["b".to_string()]));
        assert_eq!(group.subscribed_topics().len(), 2);
    }

    #[test]
    fn test_info_lists_idle_members() {
        let mut group = ConsumerGroup::new("g1");
        group.upsert_member("m-1", "c", &["t".to_string()]);
        group.upsert_member("m-2", "c", &["t".to_string()]);
        group.rebalance(|_| Some(1));
        let info = group.info();
        assert_eq!(info.member_count, 2);
        assert_eq!(info.assignment["m-1"].len(), 1);
        assert!(info.assignment["m-2"].is_empty());
    }
}
