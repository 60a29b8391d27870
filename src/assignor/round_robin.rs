use std::collections::{HashMap, HashSet};

use crate::{
    assignor::{MemberAssignment, PartitionAssigner, RebalanceProtocol, ROUND_ROBIN_ASSIGNOR_NAME},
    error::Result,
    member::{sorted_members, GroupMember, TopicSubscribers},
    metadata::TopicPartition,
    MemberId,
};

/// The round robin assignor flattens all eligible partitions, topics in
/// sorted order, into one sequence and deals them out with a single rotation
/// cursor shared across topics. The cursor only stops on members subscribed
/// to the current partition's topic, so with identical subscriptions the
/// ownership counts end up within one of each other across the whole
/// subscription universe rather than per topic.
///
/// With two members A and B and one topic of three partitions the result is
/// A = [p0, p2], B = [p1]. Diverging subscriptions can still produce
/// imbalance: a member subscribed to more topics keeps taking turns the
/// others must skip.
#[derive(Debug, Clone)]
pub struct RoundRobinAssignor;

impl PartitionAssigner for RoundRobinAssignor {
    fn name(&self) -> &str {
        ROUND_ROBIN_ASSIGNOR_NAME
    }

    fn rebalance_protocol(&self) -> RebalanceProtocol {
        RebalanceProtocol::Eager
    }

    fn member_assignments(
        &self,
        eligible_topics: &[TopicSubscribers],
        members: &[GroupMember],
    ) -> Result<HashMap<MemberId, MemberAssignment>> {
        let mut assignments: HashMap<MemberId, MemberAssignment> = members
            .iter()
            .map(|member| (member.member_id.clone(), MemberAssignment::default()))
            .collect();

        let rotation = sorted_members(members);
        if rotation.is_empty() {
            return Ok(assignments);
        }

        let mut cursor = 0usize;
        for topic in eligible_topics {
            let subscribers: HashSet<&str> = topic.members.iter().map(|m| m.as_str()).collect();
            if !rotation
                .iter()
                .any(|m| subscribers.contains(m.member_id.as_str()))
            {
                continue;
            }
            let mut partitions = topic.topic.partitions.clone();
            partitions.sort_unstable();

            for partition in partitions {
                while !subscribers.contains(rotation[cursor].member_id.as_str()) {
                    cursor = (cursor + 1) % rotation.len();
                }
                let member_id = &rotation[cursor].member_id;
                if let Some(assignment) = assignments.get_mut(member_id) {
                    assignment.partitions.push(TopicPartition {
                        topic: topic.topic.name.clone(),
                        partition,
                    });
                }
                cursor = (cursor + 1) % rotation.len();
            }
        }

        Ok(assignments)
    }
}
