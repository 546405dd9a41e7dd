//! E1.31 (sACN) sender
//!
//! Every data packet carries a 126-byte header (root, framing and DMP layers)
//! followed by at most one universe worth of channels. A controller's channels
//! are spread over consecutive universes starting at its first universe; a
//! packet never spans two universes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use super::{next_burst_len, Sender};
use crate::job::{SendFrameJob, SenderCursorState, SenderJob};
use crate::transport::{SendBatch, UdpTransport};

pub const E131_PORT: u16 = 5568;
pub const E131_HEADER_LEN: usize = 126;
pub const E131_SYNC_PACKET_LEN: usize = 49;
pub const E131_MAX_UNIVERSE_SIZE: usize = 512;
pub const E131_DEFAULT_UNIVERSE_SIZE: usize = 510;
pub const E131_DEFAULT_PRIORITY: u8 = 100;
pub const E131_DEFAULT_SOURCE_NAME: &str = "ShowPlay";

const ACN_PACKET_IDENTIFIER: [u8; 12] = [0x41, 0x53, 0x43, 0x2d, 0x45, 0x31, 0x2e, 0x31, 0x37, 0x00, 0x00, 0x00];
const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
const VECTOR_ROOT_E131_EXTENDED: u32 = 0x0000_0008;
const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
const VECTOR_E131_EXTENDED_SYNCHRONIZATION: u32 = 0x0000_0001;
const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
const DMP_ADDRESS_AND_DATA_TYPE: u8 = 0xa1;
const SOURCE_NAME_LEN: usize = 64;

pub const OPTION_PREVIEW: u8 = 0x80;
pub const OPTION_STREAM_TERMINATED: u8 = 0x40;
pub const OPTION_FORCE_SYNC: u8 = 0x20;

fn flags_and_length(length: usize) -> [u8; 2] {
    (0x7000u16 | (length as u16 & 0x0fff)).to_be_bytes()
}

fn write_root_layer(out: &mut [u8], total_len: usize, vector: u32, cid: &[u8; 16]) {
    // Preamble size, post-amble size
    out[0..2].copy_from_slice(&0x0010u16.to_be_bytes());
    out[2..4].copy_from_slice(&0x0000u16.to_be_bytes());
    out[4..16].copy_from_slice(&ACN_PACKET_IDENTIFIER);
    out[16..18].copy_from_slice(&flags_and_length(total_len - 16));
    out[18..22].copy_from_slice(&vector.to_be_bytes());
    out[22..38].copy_from_slice(cid);
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decoded E1.31 data packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E131Header {
    pub cid: [u8; 16],
    pub source_name: String,
    pub priority: u8,
    pub sync_address: u16,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,
    /// Channel count plus the start code
    pub property_count: u16,
}

impl E131Header {
    pub fn payload_len(&self) -> usize {
        self.property_count.saturating_sub(1) as usize
    }

    /// Write the 126-byte header into `out`, which must hold at least that.
    pub fn write(&self, out: &mut [u8]) {
        let total = E131_HEADER_LEN + self.payload_len();
        write_root_layer(out, total, VECTOR_ROOT_E131_DATA, &self.cid);

        // Framing layer
        out[38..40].copy_from_slice(&flags_and_length(total - 38));
        out[40..44].copy_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
        let name = &mut out[44..44 + SOURCE_NAME_LEN];
        name.fill(0);
        let source = self.source_name.as_bytes();
        let copy_len = source.len().min(SOURCE_NAME_LEN - 1);
        name[..copy_len].copy_from_slice(&source[..copy_len]);
        out[108] = self.priority;
        out[109..111].copy_from_slice(&self.sync_address.to_be_bytes());
        out[111] = self.sequence;
        out[112] = self.options;
        out[113..115].copy_from_slice(&self.universe.to_be_bytes());

        // DMP layer
        out[115..117].copy_from_slice(&flags_and_length(total - 115));
        out[117] = VECTOR_DMP_SET_PROPERTY;
        out[118] = DMP_ADDRESS_AND_DATA_TYPE;
        out[119..121].copy_from_slice(&0x0000u16.to_be_bytes());
        out[121..123].copy_from_slice(&0x0001u16.to_be_bytes());
        out[123..125].copy_from_slice(&self.property_count.to_be_bytes());
        // DMX start code
        out[125] = 0x00;
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < E131_HEADER_LEN
            || buf[4..16] != ACN_PACKET_IDENTIFIER
            || be_u32(buf, 18) != VECTOR_ROOT_E131_DATA
            || be_u32(buf, 40) != VECTOR_E131_DATA_PACKET
            || buf[117] != VECTOR_DMP_SET_PROPERTY
        {
            return None;
        }
        let mut cid = [0u8; 16];
        cid.copy_from_slice(&buf[22..38]);
        let name = &buf[44..44 + SOURCE_NAME_LEN];
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Some(Self {
            cid,
            source_name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
            priority: buf[108],
            sync_address: be_u16(buf, 109),
            sequence: buf[111],
            options: buf[112],
            universe: be_u16(buf, 113),
            property_count: be_u16(buf, 123),
        })
    }
}

/// Build a universe synchronization packet
pub fn sync_packet(cid: &[u8; 16], sequence: u8, sync_address: u16) -> [u8; E131_SYNC_PACKET_LEN] {
    let mut out = [0u8; E131_SYNC_PACKET_LEN];
    write_root_layer(&mut out, E131_SYNC_PACKET_LEN, VECTOR_ROOT_E131_EXTENDED, cid);
    out[38..40].copy_from_slice(&flags_and_length(E131_SYNC_PACKET_LEN - 38));
    out[40..44].copy_from_slice(&VECTOR_E131_EXTENDED_SYNCHRONIZATION.to_be_bytes());
    out[44] = sequence;
    out[45..47].copy_from_slice(&sync_address.to_be_bytes());
    // Two reserved bytes stay zero
    out
}

/// Sequence number and sync address of a sync packet
pub fn parse_sync_packet(buf: &[u8]) -> Option<(u8, u16)> {
    if buf.len() < E131_SYNC_PACKET_LEN
        || buf[4..16] != ACN_PACKET_IDENTIFIER
        || be_u32(buf, 18) != VECTOR_ROOT_E131_EXTENDED
        || be_u32(buf, 40) != VECTOR_E131_EXTENDED_SYNCHRONIZATION
    {
        return None;
    }
    Some((buf[44], be_u16(buf, 45)))
}

/// E1.31 sender settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct E131Options {
    pub source_name: String,
    pub priority: u8,
    /// Channels per universe
    pub universe_size: usize,
    /// Universe synchronization address. When set, data packets carry it and
    /// a sync packet follows every frame.
    pub sync_universe: Option<u16>,
    /// Component identifier (random per process if unset)
    pub cid: Option<Uuid>,
}

impl Default for E131Options {
    fn default() -> Self {
        Self {
            source_name: E131_DEFAULT_SOURCE_NAME.to_string(),
            priority: E131_DEFAULT_PRIORITY,
            universe_size: E131_DEFAULT_UNIVERSE_SIZE,
            sync_universe: None,
            cid: None,
        }
    }
}

pub struct E131Sender {
    transport: Arc<UdpTransport>,
    options: E131Options,
    template: E131Header,
    start_universe: u16,
    packet: Vec<u8>,
}

impl E131Sender {
    pub fn new(transport: Arc<UdpTransport>, options: E131Options, start_universe: u16, cid: Uuid) -> Self {
        let universe_size = options.universe_size.clamp(1, E131_MAX_UNIVERSE_SIZE);
        let template = E131Header {
            cid: *cid.as_bytes(),
            source_name: options.source_name.clone(),
            priority: options.priority,
            sync_address: options.sync_universe.unwrap_or(0),
            sequence: 0,
            options: 0,
            universe: 0,
            property_count: 1,
        };
        Self {
            transport,
            options: E131Options {
                universe_size,
                ..options
            },
            template,
            start_universe: start_universe.max(1),
            packet: Vec::with_capacity(E131_HEADER_LEN + universe_size),
        }
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn options(&self) -> &E131Options {
        &self.options
    }

    pub fn cid(&self) -> Uuid {
        Uuid::from_bytes(self.template.cid)
    }

    pub fn start_universe(&self) -> u16 {
        self.start_universe
    }

    /// Universe carrying the channel at byte offset `cursor`
    pub fn universe_for(&self, cursor: usize) -> u16 {
        let index = cursor / self.options.universe_size;
        self.start_universe.saturating_add(index.min(u16::MAX as usize) as u16)
    }

    /// Channels left in the universe that `cursor` falls in
    fn universe_room(&self, cursor: usize) -> usize {
        self.options.universe_size - cursor % self.options.universe_size
    }
}

impl Sender for E131Sender {
    fn start_batch(&mut self) {
        self.transport.start_send_batch();
    }

    fn end_batch(&mut self) -> Option<SendBatch> {
        self.transport.end_send_batch()
    }

    fn send_portion(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState) -> bool {
        let burst = sender_job.pacing.burst_size.unwrap_or(usize::MAX);
        let mut sent = 0;
        while !state.is_exhausted(sender_job) {
            let cursor = state.channel_cursor;
            let room = self.universe_room(cursor);
            let len = next_burst_len(state.remaining(sender_job), room, sent, burst);
            if len == 0 {
                break;
            }

            self.packet.clear();
            self.packet.resize(E131_HEADER_LEN, 0);
            let taken = state.gather(job, sender_job, len, &mut self.packet);

            state.sequence = state.sequence.wrapping_add(1);
            self.template.sequence = state.sequence;
            self.template.universe = self.universe_for(cursor);
            self.template.property_count = (taken + 1) as u16;
            self.template.write(&mut self.packet[..E131_HEADER_LEN]);

            self.transport.add_send_to_batch(&self.packet);
            state.packets += 1;
            sent += taken;
        }
        state.last_portion_bytes = sent;
        trace!(
            "E1.31 portion to {}: {} bytes, cursor {}",
            self.transport.destination(),
            sent,
            state.channel_cursor
        );
        !state.is_exhausted(sender_job)
    }

    fn send_push(&mut self, _job: &SendFrameJob, _sender_job: &SenderJob, state: &mut SenderCursorState) {
        let Some(sync_universe) = self.options.sync_universe else {
            return;
        };
        state.sync_sequence = state.sync_sequence.wrapping_add(1);
        let packet = sync_packet(&self.template.cid, state.sync_sequence, sync_universe);
        self.transport.add_send_to_batch(&packet);
    }
}
