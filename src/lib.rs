//! Partition assignment for Kafka consumer groups.
//!
//! This crate implements the client-side half of a consumer group rebalance:
//! given cluster metadata and the group members with their subscriptions and
//! currently owned partitions, it computes which partitions each member holds
//! after the rebalance. The three built-in assignors (`range`, `roundrobin`
//! and `cooperative-sticky`) interoperate with other Kafka clients through the
//! fixed ConsumerProtocol metadata encoding in [`protocol`].
//!
//! Everything is driven through an [`AssignorRegistry`]: register assignors at
//! client construction, then call [`AssignorRegistry::run`] with the members
//! of the current generation whenever the group coordinator triggers a
//! rebalance.

pub mod assignor;
mod error;
pub mod member;
pub mod metadata;
pub mod protocol;

pub use assignor::{
    AssignorDescriptor, AssignorRegistry, MemberAssignment, PartitionAssigner, RebalanceProtocol,
    COOPERATIVE_STICKY_ASSIGNOR_NAME, CONSUMER_PROTOCOL_TYPE, RANGE_ASSIGNOR_NAME,
    ROUND_ROBIN_ASSIGNOR_NAME,
};
pub use error::{Error, Result};
pub use member::{ConsumerGroupMetadata, GroupMember, TopicSubscribers};
pub use metadata::{Cluster, Topic, TopicName, TopicPartition};

pub type MemberId = String;
pub type PartitionId = i32;

pub fn topic_name<S: AsRef<str>>(topic: S) -> TopicName {
    TopicName(topic.as_ref().to_string())
}
