//! Session and connection reconstruction without an observed handshake.
//!
//! The engine makes one forward pass over the ordered message stream,
//! accumulating raw observations per session and per connection, then a
//! single finalization pass derives every estimate from those counters.
//! Nothing is re-estimated incrementally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use crate::models::*;
use crate::protocols::dhplus::DhPlusDetector;
use crate::protocols::enip::{EnipCommand, EnipFrame};
use crate::protocols::pccc::{self, PcccDetector};
use crate::protocols::DetectionConfidence;
use crate::timeline::Timeline;

/// Share of +1 sequence deltas above which a connection is Class 3.
const CLASS3_RATIO: (usize, usize) = (4, 5);
const MIN_SEQUENCE_SAMPLES: usize = 3;
const SEQUENCE_NUMBER_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionConfidence {
    Midstream,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferredSession {
    pub session_id: u32,
    pub confidence: SessionConfidence,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: u64,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

impl InferredSession {
    fn new(session_id: u32, first_seen: DateTime<Utc>) -> Self {
        Self {
            session_id,
            confidence: SessionConfidence::Midstream,
            first_seen,
            last_seen: first_seen,
            packet_count: 0,
            client: None,
            server: None,
        }
    }

    /// Confidence only ever moves towards `Full`.
    fn raise(&mut self, confidence: SessionConfidence) {
        self.confidence = self.confidence.max(confidence);
    }

    pub fn is_full(&self) -> bool {
        self.confidence == SessionConfidence::Full
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportClass {
    Class1,
    Class3,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolHint {
    Pccc,
    DhPlus,
}

/// Payload-size counts that remember the order sizes were first seen, so
/// the mode has a deterministic first-seen tie-break.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeHistogram {
    counts: BTreeMap<usize, u64>,
    first_seen: Vec<usize>,
}

impl SizeHistogram {
    pub fn record(&mut self, size: usize) {
        let count = self.counts.entry(size).or_insert(0);
        if *count == 0 {
            self.first_seen.push(size);
        }
        *count += 1;
    }

    pub fn count(&self, size: usize) -> u64 {
        self.counts.get(&size).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 { self.counts.values().sum() }
    pub fn is_empty(&self) -> bool { self.counts.is_empty() }
    pub fn sizes(&self) -> &[usize] { &self.first_seen }

    /// Most frequent size and its count.
    pub fn mode(&self) -> Option<(usize, u64)> {
        let mut best: Option<(usize, u64)> = None;
        for &size in &self.first_seen {
            let count = self.count(size);
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((size, count));
            }
        }
        best
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferredConnection {
    pub connection_id: u32,
    /// Owning session, 0 when no session ID accompanied the connection.
    pub session_id: u32,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: u64,
    pub transport_class: TransportClass,
    pub estimated_rpi: Option<Duration>,
    pub estimated_data_size: usize,
    pub protocol_hint: Option<ProtocolHint>,
    pub pccc_confidence: DetectionConfidence,
    pub dhplus_confidence: DetectionConfidence,
    pub payload_sizes: SizeHistogram,
    pub pccc_functions: BTreeMap<u8, u64>,
    pub dhplus_commands: BTreeMap<u8, u64>,
}

impl InferredConnection {
    fn new(connection_id: u32, first_seen: DateTime<Utc>) -> Self {
        Self {
            connection_id,
            session_id: 0,
            confidence: 0.0,
            first_seen,
            last_seen: first_seen,
            packet_count: 0,
            transport_class: TransportClass::Unknown,
            estimated_rpi: None,
            estimated_data_size: 0,
            protocol_hint: None,
            pccc_confidence: DetectionConfidence::None,
            dhplus_confidence: DetectionConfidence::None,
            payload_sizes: SizeHistogram::default(),
            pccc_functions: BTreeMap::new(),
            dhplus_commands: BTreeMap::new(),
        }
    }
}

/// Raw per-connection observations consumed by finalization.
#[derive(Default)]
struct ConnectionTrack {
    sequences: Vec<u16>,
    arrivals: Vec<DateTime<Utc>>,
    pccc: PcccDetector,
    dhplus: DhPlusDetector,
}

// ---------------------------------------------------------------------------
// Estimators
// ---------------------------------------------------------------------------

/// Median of the positive inter-arrival intervals.
pub fn estimate_rpi(arrivals: &[DateTime<Utc>]) -> Option<Duration> {
    let mut intervals: Vec<Duration> = arrivals
        .windows(2)
        .filter_map(|w| (w[1] - w[0]).to_std().ok())
        .filter(|d| !d.is_zero())
        .collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort();

    let mid = intervals.len() / 2;
    if intervals.len() % 2 == 1 {
        Some(intervals[mid])
    } else {
        Some((intervals[mid - 1] + intervals[mid]) / 2)
    }
}

/// Class 3 connections carry a sequence count that advances by one per packet.
pub fn classify_transport(sequences: &[u16]) -> TransportClass {
    if sequences.len() < MIN_SEQUENCE_SAMPLES {
        return TransportClass::Unknown;
    }
    let deltas = sequences.len() - 1;
    let increments = sequences
        .windows(2)
        .filter(|w| w[1].wrapping_sub(w[0]) == 1)
        .count();

    let (num, den) = CLASS3_RATIO;
    if increments * den > deltas * num {
        TransportClass::Class3
    } else {
        TransportClass::Class1
    }
}

/// The four signals that make up a connection's confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceScore {
    pub session: f64,
    pub samples: f64,
    pub concentration: f64,
    pub hint: f64,
}

impl ConfidenceScore {
    pub fn from_signals(session_full: bool, packets: u64, mode_count: u64, total: u64, hinted: bool) -> Self {
        let samples = match packets {
            p if p >= 100 => 0.3,
            p if p >= 10 => 0.2,
            p if p >= 3 => 0.1,
            _ => 0.05,
        };
        let concentration = if total == 0 { 0.0 } else { 0.2 * mode_count as f64 / total as f64 };
        Self {
            session: if session_full { 0.3 } else { 0.1 },
            samples,
            concentration,
            hint: if hinted { 0.2 } else { 0.0 },
        }
    }

    pub fn value(&self) -> f64 {
        (self.session + self.samples + self.concentration + self.hint).min(1.0)
    }
}

fn protocol_hint(pccc: DetectionConfidence, dhplus: DetectionConfidence) -> Option<ProtocolHint> {
    match (pccc, dhplus) {
        (DetectionConfidence::None, DetectionConfidence::None) => None,
        (p, d) if p >= d => Some(ProtocolHint::Pccc),
        _ => Some(ProtocolHint::DhPlus),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MidstreamResult {
    pub sessions: BTreeMap<u32, InferredSession>,
    pub connections: BTreeMap<u32, InferredConnection>,
    pub total_packets: u64,
}

impl MidstreamResult {
    pub fn session(&self, id: u32) -> Option<&InferredSession> { self.sessions.get(&id) }
    pub fn connection(&self, id: u32) -> Option<&InferredConnection> { self.connections.get(&id) }
}

#[derive(Default)]
pub struct MidstreamEngine {
    sessions: BTreeMap<u32, InferredSession>,
    connections: BTreeMap<u32, InferredConnection>,
    tracks: HashMap<u32, ConnectionTrack>,
    total_packets: u64,
}

impl MidstreamEngine {
    pub fn new() -> Self { Self::default() }

    /// Run both passes over an already ordered timeline.
    pub fn reconstruct(timeline: &Timeline) -> MidstreamResult {
        let mut engine = Self::new();
        for message in timeline {
            engine.observe(message);
        }
        engine.finish()
    }

    pub fn observe(&mut self, message: &ProtocolMessage) {
        self.total_packets += 1;
        let MessagePayload::Enip(frame) = &message.payload else {
            return;
        };

        if frame.session_id != 0 {
            self.observe_session(frame, message);
        }
        if frame.command == EnipCommand::SendUnitData {
            self.observe_connection(frame, message);
        }
    }

    fn observe_session(&mut self, frame: &EnipFrame, message: &ProtocolMessage) {
        let session = self.sessions.entry(frame.session_id).or_insert_with(|| {
            tracing::debug!(session = frame.session_id, "new session");
            InferredSession::new(frame.session_id, message.timestamp)
        });
        session.last_seen = message.timestamp;
        session.packet_count += 1;

        if session.client.is_none() {
            let (client, server) = if message.is_request {
                (message.src, message.dst)
            } else {
                (message.dst, message.src)
            };
            session.client = Some(client);
            session.server = Some(server);
        }

        if frame.command == EnipCommand::RegisterSession {
            session.raise(SessionConfidence::Full);
        }
    }

    fn observe_connection(&mut self, frame: &EnipFrame, message: &ProtocolMessage) {
        let Some(connection_id) = frame.connection_id() else {
            return;
        };

        let connection = self.connections.entry(connection_id).or_insert_with(|| {
            tracing::debug!(connection = connection_id, "new connection");
            InferredConnection::new(connection_id, message.timestamp)
        });
        let track = self.tracks.entry(connection_id).or_default();

        connection.last_seen = message.timestamp;
        connection.packet_count += 1;
        if connection.session_id == 0 {
            connection.session_id = frame.session_id;
        }
        track.arrivals.push(message.timestamp);

        let Some(data) = frame.connected_data() else {
            return;
        };
        connection.payload_sizes.record(data.len());

        if data.len() < SEQUENCE_NUMBER_LEN {
            return;
        }
        track.sequences.push(u16::from_le_bytes([data[0], data[1]]));

        let body = &data[SEQUENCE_NUMBER_LEN..];
        if body.is_empty() {
            return;
        }
        let pccc_body = pccc::unwrap_execute_pccc(body).unwrap_or(body);
        if let Some(header) = track.pccc.observe(pccc_body) {
            *connection.pccc_functions.entry(header.opcode()).or_insert(0) += 1;
        }
        if let Some(header) = track.dhplus.observe(body) {
            *connection.dhplus_commands.entry(header.command).or_insert(0) += 1;
        }
    }

    /// Derive every estimate from the accumulated observations.
    pub fn finish(mut self) -> MidstreamResult {
        for (id, connection) in self.connections.iter_mut() {
            let track = self.tracks.remove(id).unwrap_or_default();

            connection.estimated_rpi = estimate_rpi(&track.arrivals);
            connection.transport_class = classify_transport(&track.sequences);

            let (mode_size, mode_count) = connection.payload_sizes.mode().unwrap_or((0, 0));
            connection.estimated_data_size = mode_size;

            connection.pccc_confidence = track.pccc.confidence();
            connection.dhplus_confidence = track.dhplus.confidence();
            connection.protocol_hint =
                protocol_hint(connection.pccc_confidence, connection.dhplus_confidence);

            let session_full = self
                .sessions
                .get(&connection.session_id)
                .is_some_and(InferredSession::is_full);
            connection.confidence = ConfidenceScore::from_signals(
                session_full,
                connection.packet_count,
                mode_count,
                connection.payload_sizes.total(),
                connection.protocol_hint.is_some(),
            )
            .value();
        }

        let full = self.sessions.values().filter(|s| s.is_full()).count();
        tracing::info!(
            sessions = self.sessions.len(),
            full_sessions = full,
            connections = self.connections.len(),
            packets = self.total_packets,
            "midstream reconstruction complete"
        );

        MidstreamResult {
            sessions: self.sessions,
            connections: self.connections,
            total_packets: self.total_packets,
        }
    }
}
