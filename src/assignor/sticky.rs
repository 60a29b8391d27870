use std::cmp::Reverse;
use std::collections::{btree_map::Entry, BTreeMap, HashMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{
    assignor::{
        MemberAssignment, PartitionAssigner, RebalanceProtocol, COOPERATIVE_STICKY_ASSIGNOR_NAME,
    },
    error::Result,
    member::{sorted_members, ConsumerGroupMetadata, GroupMember, TopicSubscribers},
    metadata::{TopicName, TopicPartition},
    protocol::Assignment,
    MemberId,
};

/// The cooperative sticky assignor keeps the assignment balanced to within
/// one partition across eligible members while moving as few partitions as
/// possible relative to what each member already owns. A partition stays
/// with its current owner unless keeping it there would leave another
/// subscriber at least two partitions behind; residual ties break on member
/// order, so every member of the group computes the same result.
///
/// Under the cooperative protocol a partition that has to move is not handed
/// over directly: this cycle it shows up in the old owner's
/// `pending_revocation` and in nobody's assignment, and only the next cycle,
/// after the owner confirmed the release, does the new owner receive it.
///
/// Ownership memory survives generations two ways: the owned-partitions
/// section of the member metadata, and a small userdata payload carrying the
/// generation in which the member last received an assignment. When two
/// members claim the same partition (possible across missed generations),
/// the higher generation wins.
#[derive(Debug, Default)]
pub struct CooperativeStickyAssignor {
    state: Option<StickyState>,
}

#[derive(Debug, Clone)]
struct StickyState {
    owned: Vec<TopicPartition>,
    generation: i32,
}

impl CooperativeStickyAssignor {
    /// Generation a member's ownership claims belong to. The userdata
    /// payload takes precedence over the join-level field when present.
    fn member_generation(member: &GroupMember) -> i32 {
        if let Some(user_data) = &member.user_data {
            if user_data.len() >= 4 {
                let mut buf = user_data.clone();
                return buf.get_i32();
            }
        }
        member.generation
    }

    fn encode_user_data(generation: i32) -> Bytes {
        let mut bytes = BytesMut::with_capacity(4);
        bytes.put_i32(generation);
        bytes.freeze()
    }
}

impl PartitionAssigner for CooperativeStickyAssignor {
    fn name(&self) -> &str {
        COOPERATIVE_STICKY_ASSIGNOR_NAME
    }

    fn rebalance_protocol(&self) -> RebalanceProtocol {
        RebalanceProtocol::Cooperative
    }

    fn subscription_user_data(&self, _topics: &[TopicName]) -> Result<Option<Bytes>> {
        let generation = self.state.as_ref().map(|s| s.generation).unwrap_or(-1);
        Ok(Some(Self::encode_user_data(generation)))
    }

    fn on_assignment(
        &mut self,
        assignment: &Assignment,
        metadata: &ConsumerGroupMetadata,
    ) -> Result<()> {
        let mut owned = assignment.topic_partitions();
        owned.sort();
        self.state = Some(StickyState {
            owned,
            generation: metadata.generation_id,
        });
        Ok(())
    }

    fn member_assignments(
        &self,
        eligible_topics: &[TopicSubscribers],
        members: &[GroupMember],
    ) -> Result<HashMap<MemberId, MemberAssignment>> {
        let owners = claimed_owners(eligible_topics, members);
        let target = balanced_target(eligible_topics, members, &owners);

        let mut assignments: HashMap<MemberId, MemberAssignment> = members
            .iter()
            .map(|member| (member.member_id.clone(), MemberAssignment::default()))
            .collect();

        for (member_id, partitions) in target {
            for partition in partitions {
                match owners.get(&partition) {
                    // The partition has to change hands: withhold it from
                    // the new owner for this cycle and tell the old owner
                    // to release it.
                    Some(owner) if *owner != member_id => {
                        debug!(
                            partition = %partition,
                            from = %owner,
                            to = %member_id,
                            "partition moving, deferring handover one cycle"
                        );
                        if let Some(assignment) = assignments.get_mut(*owner) {
                            assignment.pending_revocation.push(partition);
                        }
                    }
                    _ => {
                        if let Some(assignment) = assignments.get_mut(&member_id) {
                            assignment.partitions.push(partition);
                        }
                    }
                }
            }
        }

        Ok(assignments)
    }
}

/// Validated ownership claims: owned partitions that are eligible and whose
/// owner still subscribes to the topic. Duplicate claims are resolved by the
/// higher generation, then by member order.
fn claimed_owners<'a>(
    eligible_topics: &[TopicSubscribers],
    members: &'a [GroupMember],
) -> BTreeMap<TopicPartition, &'a str> {
    let mut eligible: HashSet<TopicPartition> = HashSet::new();
    let mut subscribers: HashMap<&TopicName, HashSet<&str>> = HashMap::new();
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

    let mut claims: BTreeMap<TopicPartition, (&str, i32)> = BTreeMap::new();
    for member in sorted_members(members) {
        let generation = CooperativeStickyAssignor::member_generation(member);
        for partition in &member.owned_partitions {
            if !eligible.contains(partition) {
                continue;
            }
            if !subscribers
                .get(&partition.topic)
                .is_some_and(|s| s.contains(member.member_id.as_str()))
            {
                continue;
            }
            match claims.entry(partition.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert((member.member_id.as_str(), generation));
                }
                Entry::Occupied(mut entry) => {
                    let (holder, holder_generation) = *entry.get();
                    if generation > holder_generation {
                        debug!(
                            partition = %partition,
                            "ownership claim of {holder} (generation {holder_generation}) \
                             superseded by {} (generation {generation})",
                            member.member_id
                        );
                        entry.insert((member.member_id.as_str(), generation));
                    }
                }
            }
        }
    }

    claims
        .into_iter()
        .map(|(partition, (member_id, _))| (partition, member_id))
        .collect()
}

/// The sticky target assignment: seed every validated claim with its owner,
/// hand unclaimed partitions to the least-loaded subscriber, then move
/// partitions from overloaded members to subscribers with at least two fewer
/// until no such pair is left. All scan orders are sorted, so the result is
/// a pure function of the input.
fn balanced_target(
    eligible_topics: &[TopicSubscribers],
    members: &[GroupMember],
    owners: &BTreeMap<TopicPartition, &str>,
) -> BTreeMap<MemberId, Vec<TopicPartition>> {
    let rotation = sorted_members(members);
    let order: HashMap<MemberId, usize> = rotation
        .iter()
        .enumerate()
        .map(|(i, m)| (m.member_id.clone(), i))
        .collect();
    let mut subscribers: HashMap<TopicName, Vec<MemberId>> = HashMap::new();
    let mut all_partitions: Vec<TopicPartition> = Vec::new();
    for topic in eligible_topics {
        subscribers.insert(
            topic.topic.name.clone(),
            topic
                .members
                .iter()
                .filter(|m| order.contains_key(m.as_str()))
                .cloned()
                .collect(),
        );
        for partition in &topic.topic.partitions {
            all_partitions.push(TopicPartition {
                topic: topic.topic.name.clone(),
                partition: *partition,
            });
        }
    }
    all_partitions.sort();

    let mut assignment: BTreeMap<MemberId, Vec<TopicPartition>> = rotation
        .iter()
        .map(|m| (m.member_id.clone(), Vec::new()))
        .collect();

    for (partition, owner) in owners {
        if let Some(owned) = assignment.get_mut(*owner) {
            owned.push(partition.clone());
        }
    }

    for partition in &all_partitions {
        if owners.contains_key(partition) {
            continue;
        }
        let receiver = subscribers
            .get(&partition.topic)
            .and_then(|candidates| {
                candidates
                    .iter()
                    .min_by_key(|id| (assignment[id.as_str()].len(), order[id.as_str()]))
            })
            .cloned();
        if let Some(receiver) = receiver {
            assignment.get_mut(&receiver).unwrap().push(partition.clone());
        }
    }

    while let Some((donor, partition, receiver)) = next_move(&assignment, &subscribers, &order) {
        debug!(partition = %partition, from = %donor, to = %receiver, "rebalancing");
        assignment
            .get_mut(&donor)
            .unwrap()
            .retain(|p| *p != partition);
        assignment.get_mut(&receiver).unwrap().push(partition);
    }

    for partitions in assignment.values_mut() {
        partitions.sort();
    }
    assignment
}

/// Deterministically picks the next rebalancing move: the most loaded member
/// able to donate, its smallest movable partition, to the least loaded
/// subscriber trailing by at least two.
fn next_move(
    assignment: &BTreeMap<MemberId, Vec<TopicPartition>>,
    subscribers: &HashMap<TopicName, Vec<MemberId>>,
    order: &HashMap<MemberId, usize>,
) -> Option<(MemberId, TopicPartition, MemberId)> {
    let mut donors: Vec<&MemberId> = assignment.keys().collect();
    donors.sort_by_key(|id| (Reverse(assignment[id.as_str()].len()), order[id.as_str()]));

    for donor in donors {
        let mut partitions = assignment[donor.as_str()].clone();
        partitions.sort();
        for partition in partitions {
            let receiver = subscribers.get(&partition.topic).and_then(|candidates| {
                candidates
                    .iter()
                    .filter(|id| *id != donor)
                    .min_by_key(|id| (assignment[id.as_str()].len(), order[id.as_str()]))
            });
            if let Some(receiver) = receiver {
                if assignment[receiver.as_str()].len() + 2 <= assignment[donor.as_str()].len() {
                    return Some((donor.clone(), partition, receiver.clone()));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Topic;

    fn subscribers(topic: Topic, members: &[&str]) -> TopicSubscribers {
        TopicSubscribers {
            topic,
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn member(id: &str, topics: &[&str], owned: &[(&str, i32)]) -> GroupMember {
        let mut member = GroupMember::new(id);
        member.subscription = topics.iter().map(|t| (*t).into()).collect();
        member.owned_partitions = owned
            .iter()
            .map(|(t, p)| TopicPartition::new(*t, *p))
            .collect();
        member
    }

    fn sizes(assignments: &HashMap<MemberId, MemberAssignment>) -> Vec<usize> {
        let mut sizes: Vec<usize> = assignments.values().map(|a| a.partitions.len()).collect();
        sizes.sort_unstable();
        sizes
    }

    #[test]
    fn fresh_group_is_balanced() {
        let eligible = vec![subscribers(Topic::with_partitions("t0", 3), &["a", "b", "c"])];
        let members = vec![
            member("a", &["t0"], &[]),
            member("b", &["t0"], &[]),
            member("c", &["t0"], &[]),
        ];
        let assignments = CooperativeStickyAssignor::default()
            .member_assignments(&eligible, &members)
            .unwrap();
        assert_eq!(sizes(&assignments), vec![1, 1, 1]);
        for assignment in assignments.values() {
            assert!(assignment.pending_revocation.is_empty());
        }
    }

    #[test]
    fn stable_assignment_is_idempotent() {
        let eligible = vec![subscribers(Topic::with_partitions("t0", 3), &["a", "b"])];
        let members = vec![
            member("a", &["t0"], &[("t0", 0), ("t0", 1)]),
            member("b", &["t0"], &[("t0", 2)]),
        ];
        let assignments = CooperativeStickyAssignor::default()
            .member_assignments(&eligible, &members)
            .unwrap();
        assert_eq!(
            assignments["a"].partitions,
            vec![TopicPartition::new("t0", 0), TopicPartition::new("t0", 1)]
        );
        assert_eq!(
            assignments["b"].partitions,
            vec![TopicPartition::new("t0", 2)]
        );
        assert!(assignments["a"].pending_revocation.is_empty());
        assert!(assignments["b"].pending_revocation.is_empty());
    }

    #[test]
    fn joining_member_moves_exactly_one_partition_over_two_cycles() {
        let assignor = CooperativeStickyAssignor::default();
        let eligible = vec![subscribers(
            Topic::with_partitions("t0", 3),
            &["a", "b", "c"],
        )];
        let mut members = vec![
            member("a", &["t0"], &[("t0", 0), ("t0", 1)]),
            member("b", &["t0"], &[("t0", 2)]),
            member("c", &["t0"], &[]),
        ];

        // First cycle: the moving partition is revoked from its owner and
        // granted to nobody.
        let first = assignor.member_assignments(&eligible, &members).unwrap();
        assert_eq!(first["a"].pending_revocation, vec![TopicPartition::new("t0", 0)]);
        assert_eq!(first["a"].partitions, vec![TopicPartition::new("t0", 1)]);
        assert_eq!(first["b"].partitions, vec![TopicPartition::new("t0", 2)]);
        assert!(first["c"].partitions.is_empty());
        let granted: usize = first.values().map(|a| a.partitions.len()).sum();
        assert_eq!(granted, 2);

        // Second cycle, after the owner released the partition.
        for m in members.iter_mut() {
            m.owned_partitions = first[&m.member_id].partitions.clone();
        }
        let second = assignor.member_assignments(&eligible, &members).unwrap();
        assert_eq!(sizes(&second), vec![1, 1, 1]);
        assert_eq!(second["a"].partitions, vec![TopicPartition::new("t0", 1)]);
        assert_eq!(second["b"].partitions, vec![TopicPartition::new("t0", 2)]);
        assert_eq!(second["c"].partitions, vec![TopicPartition::new("t0", 0)]);
        for assignment in second.values() {
            assert!(assignment.pending_revocation.is_empty());
        }
    }

    #[test]
    fn leaving_member_frees_partitions_without_disturbing_the_rest() {
        // b left; its partition goes to the least loaded survivor at once.
        let eligible = vec![subscribers(Topic::with_partitions("t0", 3), &["a", "c"])];
        let members = vec![
            member("a", &["t0"], &[("t0", 0)]),
            member("c", &["t0"], &[("t0", 1)]),
        ];
        let assignments = CooperativeStickyAssignor::default()
            .member_assignments(&eligible, &members)
            .unwrap();
        assert_eq!(assignments["a"].partitions.len() + assignments["c"].partitions.len(), 3);
        assert!(assignments["a"].partitions.contains(&TopicPartition::new("t0", 0)));
        assert!(assignments["c"].partitions.contains(&TopicPartition::new("t0", 1)));
    }

    #[test]
    fn within_one_imbalance_is_retained() {
        let eligible = vec![subscribers(Topic::with_partitions("t0", 3), &["a", "b"])];
        let members = vec![
            member("a", &["t0"], &[("t0", 0), ("t0", 1)]),
            member("b", &["t0"], &[("t0", 2)]),
        ];
        let assignments = CooperativeStickyAssignor::default()
            .member_assignments(&eligible, &members)
            .unwrap();
        // 2 vs 1 is within tolerance, nothing moves.
        assert_eq!(assignments["a"].partitions.len(), 2);
        assert_eq!(assignments["b"].partitions.len(), 1);
    }

    #[test]
    fn higher_generation_wins_conflicting_claims() {
        let eligible = vec![subscribers(Topic::with_partitions("t0", 2), &["a", "b"])];
        let mut stale = member("a", &["t0"], &[("t0", 0)]);
        stale.generation = 3;
        let mut fresh = member("b", &["t0"], &[("t0", 0)]);
        fresh.generation = 5;
        let members = vec![stale, fresh];
        let owners = claimed_owners(&eligible, &members);
        assert_eq!(owners[&TopicPartition::new("t0", 0)], "b");
    }

    #[test]
    fn generation_in_user_data_takes_precedence() {
        let mut member = member("a", &["t0"], &[]);
        member.generation = 2;
        member.user_data = Some(CooperativeStickyAssignor::encode_user_data(7));
        assert_eq!(CooperativeStickyAssignor::member_generation(&member), 7);
        member.user_data = Some(Bytes::from_static(&[1]));
        assert_eq!(CooperativeStickyAssignor::member_generation(&member), 2);
    }

    #[test]
    fn on_assignment_remembers_the_generation() {
        let mut assignor = CooperativeStickyAssignor::default();
        assert_eq!(
            assignor.subscription_user_data(&[]).unwrap(),
            Some(CooperativeStickyAssignor::encode_user_data(-1))
        );

        let mut partitions = indexmap::IndexMap::new();
        partitions.insert(TopicName::from("t0"), vec![0, 1]);
        let mut metadata = ConsumerGroupMetadata::new("group");
        metadata.generation_id = 12;
        assignor
            .on_assignment(&Assignment::new(partitions), &metadata)
            .unwrap();
        assert_eq!(
            assignor.subscription_user_data(&[]).unwrap(),
            Some(CooperativeStickyAssignor::encode_user_data(12))
        );
    }

    #[test]
    fn owned_partitions_are_never_mutated() {
        let eligible = vec![subscribers(Topic::with_partitions("t0", 3), &["a", "b", "c"])];
        let members = vec![
            member("a", &["t0"], &[("t0", 0), ("t0", 1)]),
            member("b", &["t0"], &[("t0", 2)]),
            member("c", &["t0"], &[]),
        ];
        let before: Vec<Vec<TopicPartition>> =
            members.iter().map(|m| m.owned_partitions.clone()).collect();
        CooperativeStickyAssignor::default()
            .member_assignments(&eligible, &members)
            .unwrap();
        let after: Vec<Vec<TopicPartition>> =
            members.iter().map(|m| m.owned_partitions.clone()).collect();
        assert_eq!(before, after);
    }
}
