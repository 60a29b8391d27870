use std::cmp::min;
use std::collections::HashMap;

use crate::{
    assignor::{MemberAssignment, PartitionAssigner, RebalanceProtocol, RANGE_ASSIGNOR_NAME},
    error::Result,
    member::{GroupMember, TopicSubscribers},
    metadata::TopicPartition,
    MemberId,
};

/// The range assignor works on a per-topic basis: for each topic the
/// partitions are laid out in numeric order and the subscribing members in
/// member order, then split into contiguous ranges of as-even-as-possible
/// size, the first `partitions % members` members taking one extra partition.
///
/// With two members A and B and one topic of three partitions the result is
/// A = [p0, p1], B = [p2]. Members subscribed to the same set of many topics
/// accumulate the extra partition on every one of them, which is the known
/// weakness of this assignor.
#[derive(Debug, Clone)]
pub struct RangeAssignor;

impl PartitionAssigner for RangeAssignor {
    fn name(&self) -> &str {
        RANGE_ASSIGNOR_NAME
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

        for topic in eligible_topics {
            let mut partitions = topic.topic.partitions.clone();
            partitions.sort_unstable();
            if partitions.is_empty() || topic.members.is_empty() {
                continue;
            }

            let num_members = topic.members.len();
            let partitions_per_member = partitions.len() / num_members;
            let members_with_extra = partitions.len() % num_members;

            for (i, member_id) in topic.members.iter().enumerate() {
                let start = partitions_per_member * i + min(i, members_with_extra);
                let length = partitions_per_member + usize::from(i < members_with_extra);
                if let Some(assignment) = assignments.get_mut(member_id) {
                    for partition in &partitions[start..start + length] {
                        assignment.partitions.push(TopicPartition {
                            topic: topic.topic.name.clone(),
                            partition: *partition,
                        });
                    }
                }
            }
        }

        Ok(assignments)
    }
}
