//! Pluggable partition assignors and the registry dispatching to them.

mod range;
mod round_robin;
mod sticky;

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use indexmap::IndexMap;
use tracing::debug;

pub use range::RangeAssignor;
pub use round_robin::RoundRobinAssignor;
pub use sticky::CooperativeStickyAssignor;

use crate::{
    error::{Error, Result},
    member::{ConsumerGroupMetadata, GroupMember, MemberInfo, TopicSubscribers},
    metadata::{Cluster, TopicName, TopicPartition},
    protocol::{Assignment, Subscription},
    MemberId, PartitionId,
};

/// Group protocol family the consumer protocol belongs to. Fixed on the wire;
/// renaming would break JoinGroup interoperability.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

pub const RANGE_ASSIGNOR_NAME: &str = "range";
pub const ROUND_ROBIN_ASSIGNOR_NAME: &str = "roundrobin";
pub const COOPERATIVE_STICKY_ASSIGNOR_NAME: &str = "cooperative-sticky";

/// How the surrounding membership state machine has to treat partition
/// ownership around a rebalance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RebalanceProtocol {
    /// Not negotiated yet.
    #[default]
    None,
    /// All partitions are revoked before any are reassigned, in one event.
    Eager,
    /// Only partitions that actually move are revoked; a moving partition is
    /// granted to its new owner in a follow-up cycle, after confirmed
    /// release by the old owner.
    Cooperative,
}

/// Per-member result of one assignor invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberAssignment {
    pub partitions: Vec<TopicPartition>,
    /// Cooperative protocol only: partitions the member currently owns but
    /// must release because they were assigned elsewhere.
    pub pending_revocation: Vec<TopicPartition>,
}

/// An assignment algorithm. The registry owns one boxed instance per
/// protocol name for the lifetime of the client.
pub trait PartitionAssigner: Send {
    /// Wire identifier negotiated through JoinGroup.
    fn name(&self) -> &str;

    fn rebalance_protocol(&self) -> RebalanceProtocol;

    /// Computes the assignment for every member. Reads subscriptions and
    /// owned partitions, must only hand out partitions from
    /// `eligible_topics`, and must be deterministic for identical input
    /// regardless of member order.
    fn member_assignments(
        &self,
        eligible_topics: &[TopicSubscribers],
        members: &[GroupMember],
    ) -> Result<HashMap<MemberId, MemberAssignment>>;

    /// Extra per-assignor state to embed in the member metadata. Assignors
    /// without cross-generation state keep the zero-userdata default.
    fn subscription_user_data(&self, _topics: &[TopicName]) -> Result<Option<Bytes>> {
        Ok(None)
    }

    /// Called once the member's final assignment arrives from the
    /// coordinator, letting an assignor persist ownership memory across
    /// generations. State is released when the assignor is dropped.
    fn on_assignment(
        &mut self,
        _assignment: &Assignment,
        _metadata: &ConsumerGroupMetadata,
    ) -> Result<()> {
        Ok(())
    }
}

/// Custom assignor registered from a plain function, for callers that do not
/// need metadata or assignment hooks.
pub struct FnAssigner<F> {
    name: String,
    protocol: RebalanceProtocol,
    assign: F,
}

impl<F> PartitionAssigner for FnAssigner<F>
where
    F: Fn(&[TopicSubscribers], &[GroupMember]) -> Result<HashMap<MemberId, MemberAssignment>>
        + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn rebalance_protocol(&self) -> RebalanceProtocol {
        self.protocol
    }

    fn member_assignments(
        &self,
        eligible_topics: &[TopicSubscribers],
        members: &[GroupMember],
    ) -> Result<HashMap<MemberId, MemberAssignment>> {
        (self.assign)(eligible_topics, members)
    }
}

/// One registered assignor: the protocol identity plus the boxed algorithm.
/// Created at registration, immutable apart from the enabled flag, dropped
/// with the registry.
pub struct AssignorDescriptor {
    protocol_type: &'static str,
    enabled: bool,
    assigner: Box<dyn PartitionAssigner>,
}

impl AssignorDescriptor {
    fn new(assigner: Box<dyn PartitionAssigner>) -> Self {
        Self {
            protocol_type: CONSUMER_PROTOCOL_TYPE,
            enabled: true,
            assigner,
        }
    }

    pub fn name(&self) -> &str {
        self.assigner.name()
    }

    pub fn protocol_type(&self) -> &str {
        self.protocol_type
    }

    pub fn rebalance_protocol(&self) -> RebalanceProtocol {
        self.assigner.rebalance_protocol()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Serialized member metadata for a JoinGroup request advertising this
    /// assignor: subscribed topics, the assignor's userdata and the
    /// currently owned partitions.
    pub fn member_metadata(
        &self,
        topics: &[TopicName],
        owned_partitions: &[TopicPartition],
    ) -> Result<Bytes> {
        let user_data = self.assigner.subscription_user_data(topics)?;
        let mut owned: IndexMap<TopicName, Vec<PartitionId>> = IndexMap::new();
        for partition in owned_partitions {
            owned
                .entry(partition.topic.clone())
                .or_default()
                .push(partition.partition);
        }
        let subscription = Subscription::new(topics.to_vec(), user_data, owned);
        Ok(subscription.serialize_to_bytes())
    }

    pub fn on_assignment(
        &mut self,
        assignment: &Assignment,
        metadata: &ConsumerGroupMetadata,
    ) -> Result<()> {
        self.assigner.on_assignment(assignment, metadata)
    }
}

/// Ordered protocol-name → assignor mapping, owned by the client instance.
/// Populated at construction, immutable while rebalances run, dropped at
/// shutdown.
#[derive(Default)]
pub struct AssignorRegistry {
    assignors: IndexMap<String, AssignorDescriptor>,
}

impl AssignorRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registry with the three built-in assignors. The only failure mode is
    /// a duplicate built-in name, an internal invariant violation surfaced
    /// at client construction.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(RangeAssignor))?;
        registry.register(Box::new(RoundRobinAssignor))?;
        registry.register(Box::<CooperativeStickyAssignor>::default())?;
        Ok(registry)
    }

    pub fn register(&mut self, assigner: Box<dyn PartitionAssigner>) -> Result<()> {
        let name = assigner.name().to_string();
        if self.assignors.contains_key(&name) {
            return Err(Error::DuplicateAssignor(name));
        }
        self.assignors.insert(name, AssignorDescriptor::new(assigner));
        Ok(())
    }

    /// Registers a custom assignment function under `name`.
    pub fn register_fn<S, F>(&mut self, name: S, protocol: RebalanceProtocol, assign: F) -> Result<()>
    where
        S: Into<String>,
        F: Fn(&[TopicSubscribers], &[GroupMember]) -> Result<HashMap<MemberId, MemberAssignment>>
            + Send
            + 'static,
    {
        self.register(Box::new(FnAssigner {
            name: name.into(),
            protocol,
            assign,
        }))
    }

    pub fn find(&self, name: &str) -> Result<&AssignorDescriptor> {
        self.assignors
            .get(name)
            .ok_or_else(|| Error::AssignorNotAvailable(name.to_string()))
    }

    pub fn find_mut(&mut self, name: &str) -> Result<&mut AssignorDescriptor> {
        self.assignors
            .get_mut(name)
            .ok_or_else(|| Error::AssignorNotAvailable(name.to_string()))
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.find_mut(name)?.enabled = enabled;
        Ok(())
    }

    /// Assignors to advertise in the JoinGroup request, in registration
    /// order.
    pub fn enabled(&self) -> impl Iterator<Item = &AssignorDescriptor> {
        self.assignors.values().filter(|a| a.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.assignors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignors.is_empty()
    }

    /// Runs one rebalance with the negotiated assignor, writing each
    /// member's `assignment` (and `pending_revocation`) in place.
    ///
    /// The assignment is computed fully before anything is applied: on any
    /// error the members are left untouched and the previous assignment
    /// stays authoritative until the next successful cycle. Returns the
    /// assignor's rebalance protocol for the membership state machine.
    pub fn run(
        &self,
        cluster: &Cluster,
        members: &mut [GroupMember],
        protocol_name: &str,
    ) -> Result<RebalanceProtocol> {
        let descriptor = self.find(protocol_name)?;

        let eligible_topics = build_eligible_topics(cluster, members);
        for member in members.iter_mut() {
            member.eligible_topics = eligible_topics
                .iter()
                .filter(|t| member.subscribes_to(&t.topic.name))
                .map(|t| t.topic.name.clone())
                .collect();
        }

        let mut assignments = descriptor
            .assigner
            .member_assignments(&eligible_topics, members)
            .map_err(|err| Error::AssignmentFailed(format!("{protocol_name}: {err}")))?;

        verify_assignments(&eligible_topics, members, &assignments)?;

        for member in members.iter_mut() {
            let mut granted = assignments.remove(&member.member_id).unwrap_or_default();
            granted.partitions.sort();
            granted.pending_revocation.sort();
            debug!(
                member_id = %member.member_id,
                assigned = granted.partitions.len(),
                revoking = granted.pending_revocation.len(),
                "applying assignment"
            );
            member.assignment = granted.partitions;
            member.pending_revocation = granted.pending_revocation;
        }

        Ok(descriptor.rebalance_protocol())
    }
}

/// Builds the eligible-topic table: every topic subscribed by at least one
/// member and present in the cluster metadata, sorted by topic name, with
/// its subscribers in member order. Topics missing from the metadata are
/// dropped for this cycle, as if they did not exist yet.
fn build_eligible_topics(cluster: &Cluster, members: &[GroupMember]) -> Vec<TopicSubscribers> {
    let mut subscribers: BTreeMap<TopicName, Vec<&GroupMember>> = BTreeMap::new();
    for member in members {
        for topic in &member.subscription {
            let entry = subscribers.entry(topic.clone()).or_default();
            if !entry
                .iter()
                .any(|existing| existing.member_id == member.member_id)
            {
                entry.push(member);
            }
        }
    }

    let mut eligible = Vec::with_capacity(subscribers.len());
    for (topic_name, members) in subscribers {
        let Some(topic) = cluster.topic(&topic_name) else {
            debug!("skipping assignment for topic {topic_name} since no metadata is available");
            continue;
        };
        let mut infos: Vec<MemberInfo> = members.iter().map(|m| MemberInfo::of(m)).collect();
        infos.sort_by(MemberInfo::sort);
        eligible.push(TopicSubscribers {
            topic,
            members: infos.iter().map(|i| i.member_id.to_string()).collect(),
        });
    }
    eligible
}

/// Rejects assignor output that violates the common contract before any of
/// it is applied: unknown members, partitions outside the eligible table,
/// partitions granted to non-subscribers or to two members at once.
fn verify_assignments(
    eligible_topics: &[TopicSubscribers],
    members: &[GroupMember],
    assignments: &HashMap<MemberId, MemberAssignment>,
) -> Result<()> {
    let member_ids: HashSet<&str> = members.iter().map(|m| m.member_id.as_str()).collect();
    let mut subscribers: HashMap<&TopicName, HashSet<&str>> = HashMap::new();
    let mut eligible: HashSet<TopicPartition> = HashSet::new();
    for topic in eligible_topics {
        subscribers.insert(
            &topic.topic.name,
            topic.members.iter().map(|m| m.as_str()).collect(),
        );
        for partition in &topic.topic.partitions {
            eligible.insert(TopicPartition {
                topic: topic.topic.name.clone(),
                partition: *partition,
            });
        }
    }

    let mut granted: HashSet<&TopicPartition> = HashSet::new();
    for (member_id, assignment) in assignments {
        if !member_ids.contains(member_id.as_str()) {
            return Err(Error::AssignmentFailed(format!(
                "assignor produced an assignment for unknown member {member_id}"
            )));
        }
        for partition in &assignment.partitions {
            if !eligible.contains(partition) {
                return Err(Error::AssignmentFailed(format!(
                    "partition {partition} assigned to {member_id} is not eligible"
                )));
            }
            if !subscribers
                .get(&partition.topic)
                .is_some_and(|s| s.contains(member_id.as_str()))
            {
                return Err(Error::AssignmentFailed(format!(
                    "partition {partition} assigned to non-subscriber {member_id}"
                )));
            }
            if !granted.insert(partition) {
                return Err(Error::AssignmentFailed(format!(
                    "partition {partition} assigned to more than one member"
                )));
            }
        }
    }
    Ok(())
}
