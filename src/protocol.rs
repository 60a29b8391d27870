//! ConsumerProtocol wire encoding of the member metadata exchanged through
//! the group coordinator.
//!
//! The payload is self-describing: a version prefix, the subscribed topic
//! list, a free-form per-assignor userdata section and, from version 1 on,
//! the owned-partitions list. Decoders read the sections they know and skip
//! unknown trailing data, so members running different client versions can
//! still rebalance together.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;

use crate::{
    error::{Error, Result},
    metadata::{TopicName, TopicPartition},
    PartitionId,
};

/// Version 0: topics + userdata.
pub const SUBSCRIPTION_V0: i16 = 0;
/// Version 1 appends the owned-partitions section.
pub const SUBSCRIPTION_V1: i16 = 1;
pub const ASSIGNMENT_V0: i16 = 0;

const LATEST_SUBSCRIPTION_VERSION: i16 = SUBSCRIPTION_V1;
const LATEST_ASSIGNMENT_VERSION: i16 = ASSIGNMENT_V0;

/// The member-metadata payload a consumer attaches to its JoinGroup request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    pub topics: Vec<TopicName>,
    pub user_data: Option<Bytes>,
    pub owned_partitions: IndexMap<TopicName, Vec<PartitionId>>,
}

impl Subscription {
    pub fn new(
        topics: Vec<TopicName>,
        user_data: Option<Bytes>,
        owned_partitions: IndexMap<TopicName, Vec<PartitionId>>,
    ) -> Self {
        Self {
            topics,
            user_data,
            owned_partitions,
        }
    }

    fn check_version(version: i16) -> Result<i16> {
        if version < SUBSCRIPTION_V0 {
            Err(Error::InvalidVersion(version))
        } else if version > LATEST_SUBSCRIPTION_VERSION {
            Ok(LATEST_SUBSCRIPTION_VERSION)
        } else {
            Ok(version)
        }
    }

    pub fn serialize_to_bytes(&self) -> Bytes {
        self.serialize_version(LATEST_SUBSCRIPTION_VERSION)
    }

    pub fn serialize_version(&self, version: i16) -> Bytes {
        let mut bytes = BytesMut::new();
        bytes.put_i16(version);
        bytes.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(&mut bytes, topic.as_str());
        }
        put_nullable_bytes(&mut bytes, self.user_data.as_ref());
        if version >= SUBSCRIPTION_V1 {
            bytes.put_i32(self.owned_partitions.len() as i32);
            for (topic, partitions) in &self.owned_partitions {
                put_string(&mut bytes, topic.as_str());
                bytes.put_i32(partitions.len() as i32);
                for partition in partitions {
                    bytes.put_i32(*partition);
                }
            }
        }
        bytes.freeze()
    }

    pub fn deserialize_from_bytes<B: Buf>(buf: &mut B) -> Result<Self> {
        let version = read_i16(buf)?;
        let version = Subscription::check_version(version)?;

        let topic_count = read_array_len(buf, 2)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            topics.push(TopicName(read_string(buf)?));
        }

        let user_data = read_nullable_bytes(buf)?;

        let mut owned_partitions = IndexMap::new();
        // Absent owned section on a v1+ payload is tolerated: older encoders
        // stop after userdata.
        if version >= SUBSCRIPTION_V1 && buf.has_remaining() {
            let owned_count = read_array_len(buf, 2)?;
            for _ in 0..owned_count {
                let topic = TopicName(read_string(buf)?);
                let partition_count = read_array_len(buf, 4)?;
                let mut partitions = Vec::with_capacity(partition_count);
                for _ in 0..partition_count {
                    partitions.push(read_i32(buf)?);
                }
                owned_partitions.insert(topic, partitions);
            }
        }

        // Whatever a newer protocol version appended after the sections we
        // know is skipped, not rejected.
        buf.advance(buf.remaining());

        Ok(Subscription {
            topics,
            user_data,
            owned_partitions,
        })
    }

    pub fn owned_topic_partitions(&self) -> Vec<TopicPartition> {
        let mut owned = Vec::new();
        for (topic, partitions) in &self.owned_partitions {
            for partition in partitions {
                owned.push(TopicPartition {
                    topic: topic.clone(),
                    partition: *partition,
                });
            }
        }
        owned
    }
}

/// The final assignment payload a member receives from the coordinator after
/// SyncGroup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    pub partitions: IndexMap<TopicName, Vec<PartitionId>>,
    pub user_data: Option<Bytes>,
}

impl Assignment {
    pub fn new(partitions: IndexMap<TopicName, Vec<PartitionId>>) -> Self {
        Self {
            partitions,
            user_data: None,
        }
    }

    fn check_version(version: i16) -> Result<i16> {
        if version < ASSIGNMENT_V0 {
            Err(Error::InvalidVersion(version))
        } else if version > LATEST_ASSIGNMENT_VERSION {
            Ok(LATEST_ASSIGNMENT_VERSION)
        } else {
            Ok(version)
        }
    }

    pub fn serialize_to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();
        bytes.put_i16(LATEST_ASSIGNMENT_VERSION);
        bytes.put_i32(self.partitions.len() as i32);
        for (topic, partitions) in &self.partitions {
            put_string(&mut bytes, topic.as_str());
            bytes.put_i32(partitions.len() as i32);
            for partition in partitions {
                bytes.put_i32(*partition);
            }
        }
        put_nullable_bytes(&mut bytes, self.user_data.as_ref());
        bytes.freeze()
    }

    pub fn deserialize_from_bytes<B: Buf>(buf: &mut B) -> Result<Self> {
        let version = read_i16(buf)?;
        Assignment::check_version(version)?;

        let topic_count = read_array_len(buf, 2)?;
        let mut partitions = IndexMap::with_capacity(topic_count);
        for _ in 0..topic_count {
            let topic = TopicName(read_string(buf)?);
            let partition_count = read_array_len(buf, 4)?;
            let mut topic_partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                topic_partitions.push(read_i32(buf)?);
            }
            partitions.insert(topic, topic_partitions);
        }

        let user_data = read_nullable_bytes(buf)?;
        buf.advance(buf.remaining());

        Ok(Assignment {
            partitions,
            user_data,
        })
    }

    pub fn topic_partitions(&self) -> Vec<TopicPartition> {
        let mut assigned = Vec::new();
        for (topic, partitions) in &self.partitions {
            for partition in partitions {
                assigned.push(TopicPartition {
                    topic: topic.clone(),
                    partition: *partition,
                });
            }
        }
        assigned
    }
}

fn put_string(bytes: &mut BytesMut, value: &str) {
    bytes.put_i16(value.len() as i16);
    bytes.put_slice(value.as_bytes());
}

fn put_nullable_bytes(bytes: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(value) => {
            bytes.put_i32(value.len() as i32);
            bytes.put_slice(value);
        }
        None => bytes.put_i32(-1),
    }
}

fn read_i16<B: Buf>(buf: &mut B) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(Error::UnreadableMetadata("truncated int16".into()));
    }
    Ok(buf.get_i16())
}

fn read_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(Error::UnreadableMetadata("truncated int32".into()));
    }
    Ok(buf.get_i32())
}

/// Array length with a sanity bound: each element needs at least
/// `min_element_size` bytes, so a length the remaining buffer cannot possibly
/// hold is corruption, not a huge allocation.
fn read_array_len<B: Buf>(buf: &mut B, min_element_size: usize) -> Result<usize> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Err(Error::UnreadableMetadata(format!(
            "negative array length {len}"
        )));
    }
    let len = len as usize;
    if len * min_element_size > buf.remaining() {
        return Err(Error::UnreadableMetadata(format!(
            "array length {len} exceeds payload size"
        )));
    }
    Ok(len)
}

fn read_string<B: Buf>(buf: &mut B) -> Result<String> {
    let len = read_i16(buf)?;
    if len < 0 {
        return Err(Error::UnreadableMetadata(format!(
            "negative string length {len}"
        )));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::UnreadableMetadata("truncated string".into()));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::UnreadableMetadata("string is not valid utf-8".into()))
}

fn read_nullable_bytes<B: Buf>(buf: &mut B) -> Result<Option<Bytes>> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::UnreadableMetadata("truncated bytes".into()));
    }
    Ok(Some(buf.copy_to_bytes(len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription() -> Subscription {
        let mut owned = IndexMap::new();
        owned.insert(TopicName::from("t0"), vec![0, 1]);
        owned.insert(TopicName::from("t1"), vec![2]);
        Subscription::new(
            vec!["t0".into(), "t1".into()],
            Some(Bytes::from_static(b"state")),
            owned,
        )
    }

    #[test]
    fn subscription_round_trip() {
        let expected = subscription();
        let mut encoded = expected.serialize_to_bytes();
        let decoded = Subscription::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn v0_payload_has_no_owned_partitions() {
        let mut encoded = subscription().serialize_version(SUBSCRIPTION_V0);
        let decoded = Subscription::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded.topics, subscription().topics);
        assert!(decoded.owned_partitions.is_empty());
    }

    #[test]
    fn newer_version_with_trailing_sections_decodes() {
        let mut bytes = BytesMut::new();
        let body = subscription().serialize_to_bytes();
        bytes.put_i16(42);
        bytes.put_slice(&body[2..]);
        // Pretend a future version appended another section.
        bytes.put_slice(b"\x00\x00\x00\x02hi");
        let mut encoded = bytes.freeze();
        let decoded = Subscription::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded.owned_partitions, subscription().owned_partitions);
    }

    #[test]
    fn v1_payload_without_owned_section_decodes() {
        let subscription = Subscription::new(vec!["t0".into()], None, IndexMap::new());
        let v0 = subscription.serialize_version(SUBSCRIPTION_V0);
        let mut bytes = BytesMut::new();
        bytes.put_i16(SUBSCRIPTION_V1);
        bytes.put_slice(&v0[2..]);
        let mut encoded = bytes.freeze();
        let decoded = Subscription::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded.topics, subscription.topics);
        assert!(decoded.owned_partitions.is_empty());
    }

    #[test]
    fn truncated_subscription_is_unreadable() {
        let encoded = subscription().serialize_to_bytes();
        let mut truncated = encoded.slice(..encoded.len() - 3);
        let err = Subscription::deserialize_from_bytes(&mut truncated).unwrap_err();
        assert!(matches!(err, Error::UnreadableMetadata(_)));
    }

    #[test]
    fn oversized_array_length_is_unreadable() {
        let mut bytes = BytesMut::new();
        bytes.put_i16(SUBSCRIPTION_V0);
        bytes.put_i32(i32::MAX);
        let mut encoded = bytes.freeze();
        let err = Subscription::deserialize_from_bytes(&mut encoded).unwrap_err();
        assert!(matches!(err, Error::UnreadableMetadata(_)));
    }

    #[test]
    fn negative_version_is_invalid() {
        let mut encoded = Bytes::from_static(b"\xff\xfe\x00\x00\x00\x00\xff\xff\xff\xff");
        let err = Subscription::deserialize_from_bytes(&mut encoded).unwrap_err();
        assert!(matches!(err, Error::InvalidVersion(_)));
    }

    #[test]
    fn assignment_round_trip() {
        let mut partitions = IndexMap::new();
        partitions.insert(TopicName::from("t0"), vec![0, 2]);
        let mut assignment = Assignment::new(partitions);
        assignment.user_data = Some(Bytes::from_static(&[0, 0, 0, 7]));
        let mut encoded = assignment.serialize_to_bytes();
        let decoded = Assignment::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded, assignment);
        assert_eq!(
            decoded.topic_partitions(),
            vec![TopicPartition::new("t0", 0), TopicPartition::new("t0", 2)]
        );
    }

    #[test]
    fn null_user_data_stays_null() {
        let subscription = Subscription::new(vec!["t0".into()], None, IndexMap::new());
        let mut encoded = subscription.serialize_to_bytes();
        let decoded = Subscription::deserialize_from_bytes(&mut encoded).unwrap();
        assert_eq!(decoded.user_data, None);
    }
}
