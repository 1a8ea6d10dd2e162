//! Owned record types handed to the downstream sink; thin mapping off `rdkafka`'s borrowed types.

use std::collections::BTreeSet;
use std::fmt;

use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;

/// A topic + partition pair. Implements `Ord` so partition sets can live in a `BTreeSet`/`BTreeMap`
/// with deterministic iteration order (useful for logging and for tests).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An owned, deduplicated, orderable set of partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSet(BTreeSet<TopicPartition>);

impl PartitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tpl(tpl: &TopicPartitionList) -> Self {
        let set = tpl
            .elements()
            .iter()
            .map(|el| TopicPartition::new(el.topic(), el.partition()))
            .collect();
        Self(set)
    }

    pub fn to_tpl(&self) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for tp in &self.0 {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        tpl
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.0.contains(tp)
    }

    pub fn insert(&mut self, tp: TopicPartition) {
        self.0.insert(tp);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicPartition> {
        self.0.iter()
    }

    /// `self` minus every element in `other`.
    pub fn difference(&self, other: &PartitionSet) -> PartitionSet {
        PartitionSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &PartitionSet) -> PartitionSet {
        PartitionSet(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn union(&self, other: &PartitionSet) -> PartitionSet {
        PartitionSet(self.0.union(&other.0).cloned().collect())
    }
}

impl FromIterator<TopicPartition> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = TopicPartition>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PartitionSet {
    type Item = &'a TopicPartition;
    type IntoIter = std::collections::btree_set::Iter<'a, TopicPartition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A single owned record. The payload schema is opaque to this crate (§1 Out of scope) —
/// we carry raw bytes plus the positional metadata needed for committing offsets.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition: TopicPartition,
    pub offset: i64,
    pub timestamp_millis: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Record {
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|hdrs| {
                hdrs.iter()
                    .filter_map(|h| h.value.map(|v| (h.key.to_string(), v.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: TopicPartition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            timestamp_millis: msg.timestamp().to_millis(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            headers,
        }
    }
}

/// A non-empty batch of records pulled from one poll, in broker delivery order.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
