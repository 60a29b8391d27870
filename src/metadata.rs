use std::fmt;

use dashmap::DashMap;

use crate::PartitionId;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicName(pub String);

impl TopicName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TopicName {
    fn from(topic: &str) -> Self {
        TopicName(topic.to_string())
    }
}

impl From<String> for TopicName {
    fn from(topic: String) -> Self {
        TopicName(topic)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new<T: Into<TopicName>>(topic: T, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One topic's metadata as far as assignment is concerned: its name and the
/// partition ids that currently exist.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub name: TopicName,
    pub partitions: Vec<PartitionId>,
}

impl Topic {
    pub fn new<T: Into<TopicName>>(name: T, partitions: Vec<PartitionId>) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }

    /// Topic with the contiguous partitions `0..num_partitions`, the common
    /// case for metadata coming from the broker.
    pub fn with_partitions<T: Into<TopicName>>(name: T, num_partitions: i32) -> Self {
        Self {
            name: name.into(),
            partitions: (0..num_partitions).collect(),
        }
    }

    pub fn num_partitions(&self) -> i32 {
        self.partitions.len() as i32
    }
}

/// Cluster topic metadata, refreshed elsewhere and borrowed by the assignment
/// subsystem for the duration of one `run()`.
#[derive(Debug, Default)]
pub struct Cluster {
    pub topics: DashMap<TopicName, Topic>,
}

impl Cluster {
    pub fn empty() -> Cluster {
        Default::default()
    }

    pub fn from_topics<I>(topics: I) -> Cluster
    where
        I: IntoIterator<Item = Topic>,
    {
        let cluster = Cluster::empty();
        for topic in topics {
            cluster.insert_topic(topic);
        }
        cluster
    }

    pub fn insert_topic(&self, topic: Topic) {
        self.topics.insert(topic.name.clone(), topic);
    }

    pub fn contains_topic(&self, topic: &TopicName) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic(&self, topic: &TopicName) -> Option<Topic> {
        self.topics.get(topic).map(|entry| entry.value().clone())
    }

    pub fn num_partitions(&self, topic: &TopicName) -> i32 {
        if let Some(topic_entry) = self.topics.get(topic) {
            return topic_entry.value().num_partitions();
        }
        0
    }

    pub fn partitions(&self, topic: &TopicName) -> Option<Vec<PartitionId>> {
        self.topics
            .get(topic)
            .map(|entry| entry.value().partitions.clone())
    }
}
