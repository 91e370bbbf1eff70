use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{CapturedSegment, Transport};

const READER_CAPACITY: usize = 65536;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

/// Provenance of an offline capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureMetadata {
    pub filename: String,
    pub file_sha256: String,
    pub file_size: u64,
    pub linktype: i32,
    pub total_packets: u64,
    /// Packets that were read but carried no TCP/UDP payload we can route.
    pub skipped_packets: u64,
    pub parse_errors: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// PcapIngestor: pcap/pcapng file -> transport segments
// ---------------------------------------------------------------------------

pub struct PcapIngestor {
    pub metadata: CaptureMetadata,
    pub segments: Vec<CapturedSegment>,
    linktype: Linktype,
    /// Legacy pcap with the 0xa1b23c4d magic stores nanoseconds in `ts_usec`.
    nanosecond_precision: bool,
}

impl PcapIngestor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let file_size = std::fs::metadata(path)
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();

        let file_sha256 = compute_file_sha256(path)
            .with_context(|| format!("cannot hash {}", path.display()))?;

        let mut file = File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("cannot read {}", path.display()))?;

        let mut ingestor = Self::empty(filename, file_sha256, file_size);
        ingestor.ingest(&buf)?;
        Ok(ingestor)
    }

    /// Ingest a capture already held in memory.
    pub fn from_bytes(name: &str, data: &[u8]) -> Result<Self> {
        let sha256 = hex::encode(Sha256::digest(data));
        let mut ingestor = Self::empty(name.to_string(), sha256, data.len() as u64);
        ingestor.ingest(data)?;
        Ok(ingestor)
    }

    fn empty(filename: String, file_sha256: String, file_size: u64) -> Self {
        Self {
            metadata: CaptureMetadata {
                filename,
                file_sha256,
                file_size,
                linktype: Linktype::ETHERNET.0,
                ..CaptureMetadata::default()
            },
            segments: Vec::new(),
            linktype: Linktype::ETHERNET,
            nanosecond_precision: false,
        }
    }

    fn ingest(&mut self, data: &[u8]) -> Result<()> {
        tracing::info!(
            file = %self.metadata.filename,
            size = self.metadata.file_size,
            sha256 = %self.metadata.file_sha256,
            "ingesting capture"
        );

        if data.starts_with(&[0x0a, 0x0d, 0x0d, 0x0a]) {
            self.read_pcapng(data)?;
        } else {
            self.read_pcap(data)?;
        }

        tracing::info!(
            packets = self.metadata.total_packets,
            segments = self.segments.len(),
            skipped = self.metadata.skipped_packets,
            errors = self.metadata.parse_errors,
            "ingestion complete"
        );
        Ok(())
    }

    pub fn into_segments(self) -> Vec<CapturedSegment> {
        self.segments
    }

    fn read_pcap(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = LegacyPcapReader::new(READER_CAPACITY, data)
            .context("failed to create pcap reader")?;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.set_linktype(header.network);
                            self.nanosecond_precision = header.is_nanosecond_precision();
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let nanos = if self.nanosecond_precision {
                                packet.ts_usec
                            } else {
                                packet.ts_usec.saturating_mul(1000)
                            };
                            let ts = pcap_ts_to_datetime(packet.ts_sec as i64, nanos);
                            self.handle_frame(packet.data, ts);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled || reader.refill().is_err() {
                        tracing::warn!("capture ends with a truncated record");
                        self.metadata.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcap parse error");
                    self.metadata.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_pcapng(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = PcapNGReader::new(READER_CAPACITY, data)
            .context("failed to create pcapng reader")?;
        let mut if_tsresol: u64 = 1_000_000;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.set_linktype(idb.linktype);
                            if_tsresol = 1_000_000;
                            for opt in &idb.options {
                                if opt.code != OptionCode::IfTsresol {
                                    continue;
                                }
                                let Some(&val) = opt.value.first() else {
                                    continue;
                                };
                                match tsresol_units(val) {
                                    Some(units) => if_tsresol = units,
                                    None => {
                                        tracing::warn!(
                                            if_tsresol = val,
                                            "unsupported timestamp resolution, keeping microseconds"
                                        );
                                        self.metadata.parse_errors += 1;
                                    }
                                }
                            }
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let ts_raw = ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                            let secs = (ts_raw / if_tsresol) as i64;
                            let frac = (ts_raw % if_tsresol) as u128;
                            let nanos = (frac * 1_000_000_000 / if_tsresol as u128) as u32;
                            let ts = pcap_ts_to_datetime(secs, nanos);
                            self.handle_frame(epb.data, ts);
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // no timestamp on simple packets; keep them in capture order
                            let ts = self.metadata.last_timestamp.unwrap_or_default();
                            self.handle_frame(spb.data, ts);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled || reader.refill().is_err() {
                        tracing::warn!("capture ends with a truncated block");
                        self.metadata.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcapng parse error");
                    self.metadata.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    fn set_linktype(&mut self, linktype: Linktype) {
        self.linktype = linktype;
        self.metadata.linktype = linktype.0;
    }

    fn handle_frame(&mut self, data: &[u8], ts: DateTime<Utc>) {
        self.metadata.total_packets += 1;
        self.update_timestamps(ts);
        match self.parse_link_layer(data, ts) {
            Some(segment) => self.segments.push(segment),
            None => self.metadata.skipped_packets += 1,
        }
    }

    fn update_timestamps(&mut self, ts: DateTime<Utc>) {
        let meta = &mut self.metadata;
        if meta.first_timestamp.map_or(true, |first| ts < first) {
            meta.first_timestamp = Some(ts);
        }
        if meta.last_timestamp.map_or(true, |last| ts > last) {
            meta.last_timestamp = Some(ts);
        }
    }

    fn parse_link_layer(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> Option<CapturedSegment> {
        match self.linktype {
            Linktype::ETHERNET => self.parse_ethernet(data, timestamp),
            Linktype::RAW | Linktype(12) => parse_ip_packet(data, timestamp),
            Linktype::NULL => {
                // BSD loopback: 4-byte address family
                parse_ip_packet(data.get(4..)?, timestamp)
            }
            Linktype::LINUX_SLL => {
                if data.len() < 16 {
                    return None;
                }
                let ethertype = u16::from_be_bytes([data[14], data[15]]);
                if ethertype == ETHERTYPE_IPV4 || ethertype == ETHERTYPE_IPV6 {
                    parse_ip_packet(&data[16..], timestamp)
                } else {
                    None
                }
            }
            _ => {
                self.metadata.parse_errors += 1;
                None
            }
        }
    }

    fn parse_ethernet(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> Option<CapturedSegment> {
        if data.len() < 14 {
            self.metadata.parse_errors += 1;
            return None;
        }

        let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
        let mut offset = 14usize;

        // 802.1Q, possibly stacked
        while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
            if data.len() < offset + 4 {
                return None;
            }
            ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
        }

        if ethertype != ETHERTYPE_IPV4 && ethertype != ETHERTYPE_IPV6 {
            return None;
        }
        parse_ip_packet(&data[offset..], timestamp)
    }
}

fn parse_ip_packet(data: &[u8], timestamp: DateTime<Utc>) -> Option<CapturedSegment> {
    use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

    let headers = PacketHeaders::from_ip_slice(data).ok()?;

    let (src_ip, dst_ip) = match headers.net {
        Some(NetHeaders::Ipv4(ref h, _)) => (
            IpAddr::V4(Ipv4Addr::from(h.source)),
            IpAddr::V4(Ipv4Addr::from(h.destination)),
        ),
        Some(NetHeaders::Ipv6(ref h, _)) => (
            IpAddr::V6(Ipv6Addr::from(h.source)),
            IpAddr::V6(Ipv6Addr::from(h.destination)),
        ),
        _ => return None,
    };

    let (transport, src_port, dst_port) = match headers.transport {
        Some(TransportHeader::Tcp(ref tcp)) => (Transport::Tcp, tcp.source_port, tcp.destination_port),
        Some(TransportHeader::Udp(ref udp)) => (Transport::Udp, udp.source_port, udp.destination_port),
        _ => return None,
    };

    Some(CapturedSegment::new(
        timestamp,
        SocketAddr::new(src_ip, src_port),
        SocketAddr::new(dst_ip, dst_port),
        transport,
        headers.payload.slice(),
    ))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn pcap_ts_to_datetime(secs: i64, nanos: u32) -> DateTime<Utc> {
    let carry = (nanos / 1_000_000_000) as i64;
    DateTime::from_timestamp(secs.saturating_add(carry), nanos % 1_000_000_000).unwrap_or_default()
}

/// Units per second for a pcapng `if_tsresol` value, `None` when they do not
/// fit in a u64 or are zero.
fn tsresol_units(val: u8) -> Option<u64> {
    let units = if val & 0x80 != 0 {
        2u64.checked_pow((val & 0x7f) as u32)
    } else {
        10u64.checked_pow(val as u32)
    };
    units.filter(|&u| u > 0)
}

fn compute_file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
