use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::*;

/// Collects per-flow message batches and merges them into one ordered view.
#[derive(Default)]
pub struct TimelineBuilder {
    batches: Vec<Vec<ProtocolMessage>>,
}

impl TimelineBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn push_batch(&mut self, batch: Vec<ProtocolMessage>) {
        if !batch.is_empty() {
            self.batches.push(batch);
        }
    }

    pub fn pending(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn build(self) -> Timeline {
        Timeline::assemble(self.batches)
    }
}

/// Every decoded message of a capture, ordered by timestamp.
///
/// Messages sharing a timestamp keep the order their batches were pushed in
/// and, inside a batch, the order the extractor produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Timeline {
    messages: Vec<ProtocolMessage>,
}

impl Timeline {
    pub fn assemble<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Vec<ProtocolMessage>>,
    {
        let mut messages: Vec<ProtocolMessage> = batches.into_iter().flatten().collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Self { messages }
    }

    pub fn messages(&self) -> &[ProtocolMessage] { &self.messages }
    pub fn len(&self) -> usize { self.messages.len() }
    pub fn is_empty(&self) -> bool { self.messages.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, ProtocolMessage> {
        self.messages.iter()
    }

    pub fn filter(&self, protocol: Protocol) -> impl Iterator<Item = &ProtocolMessage> + '_ {
        self.messages.iter().filter(move |m| m.protocol() == protocol)
    }

    /// Message count per protocol.
    pub fn distribution(&self) -> BTreeMap<Protocol, usize> {
        let mut counts = BTreeMap::new();
        for message in &self.messages {
            *counts.entry(message.protocol()).or_insert(0) += 1;
        }
        counts
    }
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a ProtocolMessage;
    type IntoIter = std::slice::Iter<'a, ProtocolMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn message(offset_ms: i64, description: &str, payload: MessagePayload) -> ProtocolMessage {
        let ctx = MessageContext {
            timestamp: base() + Duration::milliseconds(offset_ms),
            src: "10.0.0.2:50000".parse().unwrap(),
            dst: "10.0.0.1:502".parse().unwrap(),
            transport: Transport::Tcp,
        };
        ProtocolMessage::new(&ctx, true, description, &[], payload)
    }

    #[test]
    fn test_merges_batches_by_timestamp() {
        let a = vec![
            message(0, "a0", MessagePayload::Unknown),
            message(20, "a20", MessagePayload::Unknown),
        ];
        let b = vec![message(10, "b10", MessagePayload::Unknown)];
        let timeline = Timeline::assemble(vec![a, b]);
        let order: Vec<&str> = timeline.iter().map(|m| m.description.as_str()).collect();
        assert_eq!(order, vec!["a0", "b10", "a20"]);
    }

    #[test]
    fn test_equal_timestamps_keep_push_order() {
        let mut builder = TimelineBuilder::new();
        builder.push_batch(vec![message(5, "first", MessagePayload::Unknown)]);
        builder.push_batch(Vec::new());
        builder.push_batch(vec![
            message(5, "second", MessagePayload::Unknown),
            message(5, "third", MessagePayload::Unknown),
        ]);
        assert_eq!(builder.pending(), 3);
        let timeline = builder.build();
        let order: Vec<&str> = timeline.iter().map(|m| m.description.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_filter_and_distribution() {
        use crate::protocols::dhplus::{check, DhPlusFrame};
        use crate::protocols::DetectionConfidence;

        let raw = [0x05, 0x01, 0x0F, 0x00, 0x01, 0x00];
        let dh = DhPlusFrame::new(check(&raw).unwrap(), &raw, DetectionConfidence::Low);
        let timeline = Timeline::assemble(vec![vec![
            message(0, "u1", MessagePayload::Unknown),
            message(1, "dh", MessagePayload::DhPlus(dh)),
            message(2, "u2", MessagePayload::Unknown),
        ]]);

        assert_eq!(timeline.filter(Protocol::Unknown).count(), 2);
        assert_eq!(timeline.filter(Protocol::Enip).count(), 0);
        let dist = timeline.distribution();
        assert_eq!(dist.get(&Protocol::Unknown), Some(&2));
        assert_eq!(dist.get(&Protocol::DhPlus), Some(&1));
        assert_eq!(dist.get(&Protocol::Modbus), None);
    }

    #[test]
    fn test_empty_timeline() {
        let timeline = TimelineBuilder::new().build();
        assert!(timeline.is_empty());
        assert!(timeline.distribution().is_empty());
    }
}
