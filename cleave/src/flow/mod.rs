//! Per-flow state and the worker-local flow table.

pub mod sharder;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::packet::{Address, Meta, Packet};
use crate::reassembly::Buffer;

/// 5-tuple flow key. Protocol is always TCP for tracked flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl Key {
    pub fn from_meta(meta: &Meta) -> Self {
        Self {
            src_ip: meta.src_ip,
            dst_ip: meta.dst_ip,
            src_port: meta.src_port,
            dst_port: meta.dst_port,
            proto: meta.proto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Collecting,
    /// Split succeeded; everything else passes through until FIN/RST/GC.
    Injected,
    /// Splitting was abandoned; behaves like `Injected`, kept distinct for
    /// diagnostics.
    PassThrough,
}

/// Header-area copy of the most recent payload-bearing packet on a flow,
/// used to fabricate split segments. Holding a copy rather than the packet
/// itself keeps held-packet ownership single.
#[derive(Debug)]
pub struct Template {
    pub header: Vec<u8>,
    pub addr: Address,
    pub ip_header_len: usize,
    pub payload_len: usize,
    pub flags: u8,
    pub ip_id: u16,
}

impl Template {
    pub fn from_packet(pkt: &Packet) -> Option<Self> {
        let header_len = pkt.meta.ip_header_len + pkt.meta.tcp_header_len;
        if header_len == 0 || header_len > pkt.data.len() {
            return None;
        }
        Some(Self {
            header: pkt.data[..header_len].to_vec(),
            addr: pkt.addr.clone(),
            ip_header_len: pkt.meta.ip_header_len,
            payload_len: pkt.payload().len(),
            flags: pkt.meta.flags,
            ip_id: crate::packet::ipv4_id(&pkt.data),
        })
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }
}

#[derive(Debug)]
pub struct FlowState {
    pub state: State,
    pub base_seq: u32,
    pub last_active: Instant,
    pub collect_start: Instant,
    pub first_payload_len: usize,
    pub template: Option<Template>,
    /// Captured packets not yet released, in release order.
    pub held_packets: VecDeque<Packet>,
    pub reassembler: Option<Buffer>,
    /// Set after a successful inject; diagnostic only.
    pub processed: bool,
}

impl FlowState {
    fn new(now: Instant) -> Self {
        Self {
            state: State::New,
            base_seq: 0,
            last_active: now,
            collect_start: now,
            first_payload_len: 0,
            template: None,
            held_packets: VecDeque::new(),
            reassembler: None,
            processed: false,
        }
    }
}

/// Worker-local flow table. Single-threaded by construction; no internal
/// synchronisation.
#[derive(Debug, Default)]
pub struct Table {
    items: HashMap<Key, FlowState>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.items.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut FlowState> {
        self.items.get_mut(key)
    }

    /// Existing entries keep their `last_active`; only a fresh entry is
    /// stamped with `now`.
    pub fn get_or_create(&mut self, key: Key, now: Instant) -> &mut FlowState {
        self.items.entry(key).or_insert_with(|| FlowState::new(now))
    }

    pub fn delete(&mut self, key: &Key) -> Option<FlowState> {
        self.items.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.items.keys().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Key, &mut FlowState)> {
        self.items.iter_mut()
    }
}
