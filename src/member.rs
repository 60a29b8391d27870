//! Group member model for a single rebalance cycle.

use std::cmp::Ordering;

use bytes::Bytes;
use tracing::warn;

use crate::{
    metadata::{Topic, TopicName, TopicPartition},
    protocol::Subscription,
    MemberId,
};

/// One member of the consumer group, as reported by the JoinGroup response.
/// The set of members lives for exactly one rebalance cycle; assignors read
/// `subscription` and `owned_partitions` and write `assignment` (and, under
/// the cooperative protocol, `pending_revocation`) — nothing else.
#[derive(Debug, Clone, Default)]
pub struct GroupMember {
    pub member_id: MemberId,
    /// Stable identity surviving restarts (static membership).
    pub group_instance_id: Option<String>,
    pub subscription: Vec<TopicName>,
    /// Partitions the member reports as currently held. Input only, never
    /// touched by an assignor.
    pub owned_partitions: Vec<TopicPartition>,
    /// Output of the rebalance.
    pub assignment: Vec<TopicPartition>,
    /// Cooperative protocol only: partitions this member must release before
    /// their new owner picks them up next cycle.
    pub pending_revocation: Vec<TopicPartition>,
    /// Subscribed topics that exist in the current cluster metadata. Cached
    /// by the orchestrator while building the eligible-topic table.
    pub eligible_topics: Vec<TopicName>,
    /// Opaque per-assignor payload carried inside the member metadata.
    pub user_data: Option<Bytes>,
    pub generation: i32,
}

impl GroupMember {
    pub fn new<S: Into<MemberId>>(member_id: S) -> Self {
        Self {
            member_id: member_id.into(),
            generation: -1,
            ..Default::default()
        }
    }

    /// Builds a member from the raw metadata blob attached to a JoinGroup
    /// response entry. A corrupt blob degrades this one member to an empty
    /// subscription instead of failing the whole rebalance.
    pub fn from_metadata<S: Into<MemberId>>(
        member_id: S,
        group_instance_id: Option<String>,
        mut metadata: Bytes,
    ) -> Self {
        let mut member = GroupMember::new(member_id);
        member.group_instance_id = group_instance_id;
        match Subscription::deserialize_from_bytes(&mut metadata) {
            Ok(subscription) => {
                member.owned_partitions = subscription.owned_topic_partitions();
                member.subscription = subscription.topics;
                member.user_data = subscription.user_data;
            }
            Err(err) => {
                warn!(
                    member_id = %member.member_id,
                    "ignoring unreadable member metadata: {err}"
                );
            }
        }
        member
    }

    pub fn subscribes_to(&self, topic: &TopicName) -> bool {
        self.subscription.contains(topic)
    }

    pub fn owns(&self, partition: &TopicPartition) -> bool {
        self.owned_partitions.contains(partition)
    }
}

/// Identity view used for ordering members. Static members sort before
/// dynamic ones so that a rolling restart of static members does not shuffle
/// the assignment; the final tie-break is the lexicographic member id, which
/// makes the order total and reproducible on every member of the group.
#[derive(Debug, Clone)]
pub struct MemberInfo<'a> {
    pub member_id: &'a str,
    pub group_instance_id: Option<&'a str>,
}

impl<'a> MemberInfo<'a> {
    pub fn of(member: &'a GroupMember) -> Self {
        Self {
            member_id: &member.member_id,
            group_instance_id: member.group_instance_id.as_deref(),
        }
    }

    pub fn sort(member_a: &MemberInfo, member_b: &MemberInfo) -> Ordering {
        match (member_a.group_instance_id, member_b.group_instance_id) {
            (Some(a), Some(b)) => a.cmp(b).then(member_a.member_id.cmp(member_b.member_id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => member_a.member_id.cmp(member_b.member_id),
        }
    }
}

/// Members in the group's total order.
pub fn sorted_members(members: &[GroupMember]) -> Vec<&GroupMember> {
    let mut sorted: Vec<&GroupMember> = members.iter().collect();
    sorted.sort_by(|a, b| MemberInfo::sort(&MemberInfo::of(a), &MemberInfo::of(b)));
    sorted
}

/// One eligible topic and the members subscribed to it, in member order.
/// Built per rebalance by the orchestrator and discarded afterwards.
#[derive(Debug, Clone)]
pub struct TopicSubscribers {
    pub topic: Topic,
    pub members: Vec<MemberId>,
}

/// The slice of group state an assignor may need when its final assignment
/// arrives from the coordinator.
#[derive(Debug, Clone)]
pub struct ConsumerGroupMetadata {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
}

impl ConsumerGroupMetadata {
    pub fn new<S: Into<String>>(group_id: S) -> Self {
        Self {
            group_id: group_id.into(),
            generation_id: -1,
            member_id: MemberId::default(),
            group_instance_id: None,
        }
    }
}
