//! Per-flow processing: the collect → split → inject state machine.
//!
//! Each worker is a single-threaded event loop over its input channel, its
//! touch channel, and a GC tick. All flow state, held packets, and byte
//! budgets are worker-local; the only shared state is the configuration
//! pointer, swapped atomically on reload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::EngineError;
use crate::adapter::Adapter;
use crate::flow::{FlowState, Key, State, Table, Template};
use crate::packet::{
    self, Address, Packet, Source, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN,
};
use crate::reassembly::Buffer;
use crate::runtime::conf::{EngineConf, SplitMode};
use crate::tls::{self, Detection};

const MAX_IPV4_TOTAL_LEN: usize = 0xffff;

/// Per-worker resource accounting. Sums over all live flows on the worker.
#[derive(Debug, Default)]
pub(crate) struct Budget {
    pub held_bytes: u64,
    pub reassembly_bytes: u64,
}

pub(crate) struct Worker {
    id: usize,
    cfg: Arc<ArcSwap<EngineConf>>,
    adapter: Arc<dyn Adapter>,
    in_rx: mpsc::Receiver<Packet>,
    touch_rx: mpsc::Receiver<Key>,
    pub(crate) flows: Table,
    budget: Budget,
}

enum Event {
    Cancelled,
    Packet(Packet),
    InClosed,
    Touch(Key),
    TouchClosed,
    Gc,
}

/// What the split evaluation decided for the current contiguous prefix.
enum Decision {
    Wait,
    Abort,
    Split(usize),
}

/// Everything needed to fabricate segments, copied out of the flow state so
/// no borrow of it is held across adapter calls.
struct SplitPlan {
    window: Vec<u8>,
    remainder: Vec<u8>,
    max_payload: usize,
    can_trim: bool,
    header: Vec<u8>,
    addr: Address,
    ip_header_len: usize,
    flags: u8,
    start_ip_id: u16,
    base_seq: u32,
}

enum Plan {
    NotReady,
    Abort,
    Split(Box<SplitPlan>),
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        cfg: Arc<ArcSwap<EngineConf>>,
        adapter: Arc<dyn Adapter>,
        in_rx: mpsc::Receiver<Packet>,
        touch_rx: mpsc::Receiver<Key>,
    ) -> Self {
        Self {
            id,
            cfg,
            adapter,
            in_rx,
            touch_rx,
            flows: Table::new(),
            budget: Budget::default(),
        }
    }

    pub(crate) async fn run(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut gc_period = effective_gc_interval(&self.cfg.load());
        let mut ticker = time::interval_at(time::Instant::now() + gc_period, gc_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut touch_open = true;

        debug!(event.name = "worker.started", worker.id = self.id);
        loop {
            let ev = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                maybe = self.in_rx.recv() => maybe.map(Event::Packet).unwrap_or(Event::InClosed),
                maybe = self.touch_rx.recv(), if touch_open => {
                    maybe.map(Event::Touch).unwrap_or(Event::TouchClosed)
                }
                _ = ticker.tick() => Event::Gc,
            };
            match ev {
                Event::Cancelled => return Err(EngineError::Cancelled),
                Event::InClosed => return Ok(()),
                Event::Packet(pkt) => self.handle_packet(pkt).await?,
                Event::Touch(key) => {
                    if let Some(st) = self.flows.get_mut(&key) {
                        st.last_active = Instant::now();
                    }
                }
                Event::TouchClosed => touch_open = false,
                Event::Gc => {
                    self.gc().await?;
                    let next = effective_gc_interval(&self.cfg.load());
                    if next != gc_period {
                        gc_period = next;
                        ticker = time::interval_at(time::Instant::now() + next, next);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }

    pub(crate) async fn handle_packet(&mut self, pkt: Packet) -> Result<(), EngineError> {
        let cfg = self.cfg.load_full();
        let now = Instant::now();
        let key = Key::from_meta(&pkt.meta);
        let payload_len = pkt.payload().len();
        let is_fin = pkt.has_flag(TCP_FLAG_FIN);
        let is_rst = pkt.has_flag(TCP_FLAG_RST);
        let is_syn = pkt.has_flag(TCP_FLAG_SYN);

        if let Some(st) = self.flows.get_mut(&key) {
            st.last_active = now;

            // FIN/RST often carry no payload; they must still clean up flow
            // state promptly even though payloadless packets are otherwise
            // fast-pathed.
            if payload_len == 0 && (is_rst || is_fin) {
                if st.state == State::Collecting {
                    Self::fail_open(&self.adapter, &mut self.budget, st).await?;
                }
                self.adapter.send(pkt).await?;
                self.flows.delete(&key);
                return Ok(());
            }

            if st.state == State::Injected || st.state == State::PassThrough {
                self.adapter.send(pkt).await?;
                return Ok(());
            }
            if payload_len == 0 {
                self.adapter.send(pkt).await?;
                return Ok(());
            }
        } else {
            // No tracked state: payloadless packets never create a flow.
            if payload_len == 0 {
                self.adapter.send(pkt).await?;
                return Ok(());
            }

            // DoS guards, best-effort before any per-flow state exists.
            if cfg.max_flows_per_worker > 0 && self.flows.len() >= cfg.max_flows_per_worker {
                trace!(
                    event.name = "worker.flow_cap_passthrough",
                    worker.id = self.id,
                    flows = self.flows.len(),
                );
                self.adapter.send(pkt).await?;
                return Ok(());
            }
            if cfg.max_held_bytes_per_worker > 0
                && self.budget.held_bytes + pkt.data.len() as u64 > cfg.max_held_bytes_per_worker
            {
                self.adapter.send(pkt).await?;
                return Ok(());
            }
            if cfg.max_reassembly_bytes_per_worker > 0
                && self.budget.reassembly_bytes + payload_len as u64
                    > cfg.max_reassembly_bytes_per_worker
            {
                self.adapter.send(pkt).await?;
                return Ok(());
            }
        }

        // The packet joins the held list before the guards run so that a
        // guard firing releases it along with everything already held.
        let payload = pkt.payload().to_vec();
        let seq = pkt.meta.seq;
        let pkt_len = pkt.data.len() as u64;

        let st = self.flows.get_or_create(key, now);
        st.last_active = now;
        if st.state == State::New {
            st.base_seq = seq;
            st.reassembler = Some(Buffer::new(seq, cfg.max_buffer_bytes as u32));
            st.state = State::Collecting;
            st.collect_start = now;
            st.first_payload_len = payload.len();
        }
        st.template = Template::from_packet(&pkt);

        if cfg.max_held_bytes_per_worker > 0
            && self.budget.held_bytes + pkt_len > cfg.max_held_bytes_per_worker
        {
            // The packet that would overflow the budget is passed through,
            // not held.
            Self::fail_open(&self.adapter, &mut self.budget, st).await?;
            self.adapter.send(pkt).await?;
            return Ok(());
        }
        st.held_packets.push_back(pkt);
        self.budget.held_bytes += pkt_len;

        if st.held_packets.len() >= cfg.max_held_packets {
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }
        if now.duration_since(st.collect_start) > cfg.collect_timeout {
            debug!(event.name = "flow.collect_timeout", worker.id = self.id);
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }

        if st.reassembler.is_none() {
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }
        let mut push_ok = false;
        if let Some(reasm) = st.reassembler.as_mut() {
            let before = u64::from(reasm.total_bytes());
            push_ok = reasm.push(seq, &payload).is_ok();
            let grew = u64::from(reasm.total_bytes()).saturating_sub(before);
            self.budget.reassembly_bytes = self.budget.reassembly_bytes.saturating_add(grew);
        }
        if !push_ok {
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }
        if cfg.max_reassembly_bytes_per_worker > 0
            && self.budget.reassembly_bytes > cfg.max_reassembly_bytes_per_worker
        {
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }

        // A retransmitted handshake invalidates the sequence anchor.
        if is_syn {
            return Self::fail_open(&self.adapter, &mut self.budget, st).await;
        }
        if is_rst || is_fin {
            Self::fail_open(&self.adapter, &mut self.budget, st).await?;
            self.flows.delete(&key);
            return Ok(());
        }

        match cfg.split_mode {
            SplitMode::Immediate => self.try_split_immediate(&cfg, &key).await,
            SplitMode::TlsHello => self.try_split_tls_hello(&cfg, &key).await,
        }
    }

    async fn try_split_immediate(
        &mut self,
        cfg: &EngineConf,
        key: &Key,
    ) -> Result<(), EngineError> {
        let Some(st) = self.flows.get_mut(key) else {
            return Ok(());
        };
        if st.first_payload_len == 0 {
            return Ok(());
        }
        let window = st.first_payload_len;
        let ready = st
            .reassembler
            .as_ref()
            .map(|r| r.contiguous().len() >= window);
        match ready {
            None => Self::fail_open(&self.adapter, &mut self.budget, st).await,
            Some(false) => Ok(()),
            Some(true) => {
                Self::inject_window(&self.adapter, &mut self.budget, cfg, st, window).await
            }
        }
    }

    async fn try_split_tls_hello(
        &mut self,
        cfg: &EngineConf,
        key: &Key,
    ) -> Result<(), EngineError> {
        let Some(st) = self.flows.get_mut(key) else {
            return Ok(());
        };
        let decision = match st.reassembler.as_ref() {
            None => Decision::Abort,
            Some(reasm) => {
                let contig = reasm.contiguous();
                match tls::detect_client_hello_record(contig) {
                    Detection::NeedMore => Decision::Wait,
                    Detection::Mismatch => Decision::Abort,
                    Detection::Match(record_len) => {
                        let need = 5 + usize::from(record_len);
                        if need > cfg.max_buffer_bytes {
                            Decision::Abort
                        } else if contig.len() < need {
                            Decision::Wait
                        } else {
                            Decision::Split(need)
                        }
                    }
                }
            }
        };
        match decision {
            Decision::Wait => Ok(()),
            Decision::Abort => Self::fail_open(&self.adapter, &mut self.budget, st).await,
            Decision::Split(need) => {
                Self::inject_window(&self.adapter, &mut self.budget, cfg, st, need).await
            }
        }
    }

    /// Re-emit `contig[..window_len]` as two or more fabricated segments,
    /// forward the remainder, drop the originals, and mark the flow
    /// `Injected`. Any failure along the way rolls back to fail-open.
    async fn inject_window(
        adapter: &Arc<dyn Adapter>,
        budget: &mut Budget,
        cfg: &EngineConf,
        st: &mut FlowState,
        window_len: usize,
    ) -> Result<(), EngineError> {
        if window_len < 1 {
            return Self::fail_open(adapter, budget, st).await;
        }
        let plan = match (&st.reassembler, &st.template) {
            (Some(reasm), Some(tpl)) => {
                let contig = reasm.contiguous();
                if contig.len() < window_len {
                    Plan::NotReady
                } else {
                    let max_payload = clamp_segment_payload(
                        tpl.payload_len,
                        tpl.header_len(),
                        cfg.max_segment_payload,
                    );
                    if max_payload < 1 {
                        Plan::Abort
                    } else {
                        Plan::Split(Box::new(SplitPlan {
                            window: contig[..window_len].to_vec(),
                            remainder: contig[window_len..].to_vec(),
                            max_payload,
                            can_trim: !reasm.had_out_of_order() && !reasm.had_overlap(),
                            header: tpl.header.clone(),
                            addr: tpl.addr.clone(),
                            ip_header_len: tpl.ip_header_len,
                            flags: tpl.flags,
                            start_ip_id: tpl.ip_id,
                            base_seq: st.base_seq,
                        }))
                    }
                }
            }
            _ => Plan::Abort,
        };

        let plan = match plan {
            Plan::NotReady => return Ok(()),
            Plan::Abort => return Self::fail_open(adapter, budget, st).await,
            Plan::Split(plan) => plan,
        };

        let split_segs = split_first(&plan.window, cfg.split_chunk, plan.max_payload);
        if split_segs.len() < 2 {
            return Self::fail_open(adapter, budget, st).await;
        }

        let flags_no_psh_fin = plan.flags & !(TCP_FLAG_PSH | TCP_FLAG_FIN);
        let split_last_flags = if plan.remainder.is_empty() {
            plan.flags
        } else {
            flags_no_psh_fin
        };

        let mut ip_id = plan.start_ip_id;
        if Self::send_segments(
            adapter,
            &plan.header,
            &plan.addr,
            plan.ip_header_len,
            plan.base_seq,
            &split_segs,
            flags_no_psh_fin,
            split_last_flags,
            &mut ip_id,
        )
        .await
        .is_err()
        {
            return Self::fail_open(adapter, budget, st).await;
        }

        if !plan.remainder.is_empty() {
            if plan.can_trim {
                // Reinject the original packets trimmed at the window
                // boundary, preserving their TCP options and pacing.
                if Self::reinject_trimmed(adapter, st, window_len as u32, &mut ip_id)
                    .await
                    .is_err()
                {
                    return Self::fail_open(adapter, budget, st).await;
                }
            } else {
                let rem_segs = chunk_payload(&plan.remainder, plan.max_payload);
                if Self::send_segments(
                    adapter,
                    &plan.header,
                    &plan.addr,
                    plan.ip_header_len,
                    plan.base_seq.wrapping_add(window_len as u32),
                    &rem_segs,
                    flags_no_psh_fin,
                    plan.flags,
                    &mut ip_id,
                )
                .await
                .is_err()
                {
                    return Self::fail_open(adapter, budget, st).await;
                }
            }
        }

        // The kernel must not also deliver the originals.
        Self::drop_held(adapter, budget, st).await?;

        st.state = State::Injected;
        Self::clear_collecting(budget, st);
        st.processed = true;
        debug!(event.name = "flow.injected", window_len);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_segments(
        adapter: &Arc<dyn Adapter>,
        header: &[u8],
        addr: &Address,
        ip_header_len: usize,
        base_seq: u32,
        segments: &[&[u8]],
        flags: u8,
        last_flags: u8,
        ip_id: &mut u16,
    ) -> Result<(), EngineError> {
        let mut offset = 0u32;
        for (i, seg) in segments.iter().enumerate() {
            if seg.is_empty() {
                continue;
            }
            let seg_flags = if i == segments.len() - 1 {
                last_flags
            } else {
                flags
            };
            let mut new_pkt = fabricate_segment(
                header,
                addr,
                ip_header_len,
                base_seq.wrapping_add(offset),
                seg,
                seg_flags,
                ip_id,
            );
            adapter.calc_checksums(&mut new_pkt)?;
            adapter.send(new_pkt).await?;
            offset = offset.wrapping_add(seg.len() as u32);
        }
        Ok(())
    }

    async fn reinject_trimmed(
        adapter: &Arc<dyn Adapter>,
        st: &FlowState,
        window_len: u32,
        ip_id: &mut u16,
    ) -> Result<(), EngineError> {
        for pkt in &st.held_packets {
            let payload = pkt.payload();
            if payload.is_empty() {
                continue;
            }
            let offset = pkt.meta.seq.wrapping_sub(st.base_seq);
            let end = u64::from(offset) + payload.len() as u64;
            if end <= u64::from(window_len) {
                continue;
            }

            let trim = if offset < window_len {
                (window_len - offset) as usize
            } else {
                0
            };
            if trim >= payload.len() {
                continue;
            }

            let header_len = pkt.meta.ip_header_len + pkt.meta.tcp_header_len;
            let mut new_pkt = fabricate_segment(
                &pkt.data[..header_len],
                &pkt.addr,
                pkt.meta.ip_header_len,
                pkt.meta.seq.wrapping_add(trim as u32),
                &payload[trim..],
                pkt.meta.flags,
                ip_id,
            );
            adapter.calc_checksums(&mut new_pkt)?;
            adapter.send(new_pkt).await?;
        }
        Ok(())
    }

    /// Release every held packet unmodified, give up on splitting this
    /// flow, and park it in `PassThrough`.
    async fn fail_open(
        adapter: &Arc<dyn Adapter>,
        budget: &mut Budget,
        st: &mut FlowState,
    ) -> Result<(), EngineError> {
        while let Some(pkt) = st.held_packets.pop_front() {
            budget.held_bytes = budget.held_bytes.saturating_sub(pkt.data.len() as u64);
            adapter.send(pkt).await?;
        }
        st.state = State::PassThrough;
        Self::clear_collecting(budget, st);
        Ok(())
    }

    async fn drop_held(
        adapter: &Arc<dyn Adapter>,
        budget: &mut Budget,
        st: &mut FlowState,
    ) -> Result<(), EngineError> {
        while let Some(pkt) = st.held_packets.pop_front() {
            budget.held_bytes = budget.held_bytes.saturating_sub(pkt.data.len() as u64);
            adapter.drop_packet(pkt).await?;
        }
        Ok(())
    }

    fn clear_collecting(budget: &mut Budget, st: &mut crate::flow::FlowState) {
        while let Some(pkt) = st.held_packets.pop_front() {
            budget.held_bytes = budget.held_bytes.saturating_sub(pkt.data.len() as u64);
        }
        if let Some(reasm) = st.reassembler.take() {
            budget.reassembly_bytes = budget
                .reassembly_bytes
                .saturating_sub(u64::from(reasm.total_bytes()));
        }
        st.template = None;
    }

    async fn gc(&mut self) -> Result<(), EngineError> {
        let cfg = self.cfg.load_full();
        let idle = if cfg.flow_idle_timeout > Duration::ZERO {
            cfg.flow_idle_timeout
        } else {
            Duration::from_secs(30)
        };
        let now = Instant::now();

        let keys: Vec<Key> = self.flows.keys().collect();
        let mut first_err: Option<EngineError> = None;
        let mut evicted = 0usize;
        for key in keys {
            let Some(st) = self.flows.get_mut(&key) else {
                continue;
            };
            if now.duration_since(st.last_active) <= idle {
                continue;
            }
            if st.state == State::Collecting && !st.held_packets.is_empty() {
                if let Err(e) = Self::fail_open(&self.adapter, &mut self.budget, st).await {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    continue;
                }
            }
            self.flows.delete(&key);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                event.name = "worker.gc",
                worker.id = self.id,
                evicted,
                live = self.flows.len(),
            );
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reinject everything still held or queued, in order: held packets per
    /// flow first, then the input channel. Bounded by the deadline, the
    /// token, and the configured packet cap.
    pub(crate) async fn shutdown_fail_open(
        &mut self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        let cfg = self.cfg.load_full();
        let max_packets = if cfg.shutdown_fail_open_max_packets > 0 {
            cfg.shutdown_fail_open_max_packets
        } else {
            200_000
        };
        let mut flushed = 0usize;
        let mut first_err: Option<EngineError> = None;

        let keys: Vec<Key> = self.flows.keys().collect();
        for key in keys {
            loop {
                if let Some(stop) = stop_reason(cancel, deadline, flushed, max_packets) {
                    return Err(join_opt(first_err, stop));
                }
                let Some(st) = self.flows.get_mut(&key) else {
                    break;
                };
                let Some(pkt) = st.held_packets.pop_front() else {
                    break;
                };
                self.budget.held_bytes =
                    self.budget.held_bytes.saturating_sub(pkt.data.len() as u64);
                match self.adapter.send(pkt).await {
                    Ok(()) => flushed += 1,
                    Err(e) => {
                        warn!(
                            event.name = "worker.shutdown_send_failed",
                            worker.id = self.id,
                            error.message = %e,
                        );
                        if first_err.is_none() {
                            first_err = Some(e.into());
                        }
                    }
                }
            }
        }

        loop {
            if let Some(stop) = stop_reason(cancel, deadline, flushed, max_packets) {
                return Err(join_opt(first_err, stop));
            }
            match self.in_rx.try_recv() {
                Ok(pkt) => match self.adapter.send(pkt).await {
                    Ok(()) => flushed += 1,
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e.into());
                        }
                    }
                },
                Err(_) => break,
            }
        }

        if flushed > 0 {
            debug!(
                event.name = "worker.shutdown_fail_open",
                worker.id = self.id,
                flushed,
            );
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn budget(&self) -> &Budget {
        &self.budget
    }
}

fn stop_reason(
    cancel: &CancellationToken,
    deadline: Instant,
    flushed: usize,
    max_packets: usize,
) -> Option<EngineError> {
    if cancel.is_cancelled() {
        return Some(EngineError::Cancelled);
    }
    if Instant::now() >= deadline {
        return Some(EngineError::DeadlineExceeded);
    }
    if flushed >= max_packets {
        return Some(EngineError::ShutdownFailOpenLimitReached);
    }
    None
}

fn join_opt(first: Option<EngineError>, stop: EngineError) -> EngineError {
    match first {
        Some(f) => EngineError::Joined(Box::new(f), Box::new(stop)),
        None => stop,
    }
}

fn effective_gc_interval(cfg: &EngineConf) -> Duration {
    if cfg.gc_interval > Duration::ZERO {
        cfg.gc_interval
    } else {
        Duration::from_secs(5)
    }
}

/// Build one TCP segment from a template header area: rewrite total length,
/// IP ID, sequence, and flags; zero both checksums for recomputation.
fn fabricate_segment(
    header: &[u8],
    addr: &Address,
    ip_header_len: usize,
    seq: u32,
    payload: &[u8],
    flags: u8,
    ip_id: &mut u16,
) -> Packet {
    let mut data = Vec::with_capacity(header.len() + payload.len());
    data.extend_from_slice(header);
    data.extend_from_slice(payload);
    packet::set_ipv4_total_len(&mut data, (header.len() + payload.len()) as u16);
    packet::set_ipv4_id(&mut data, *ip_id);
    *ip_id = ip_id.wrapping_add(1);
    packet::set_tcp_seq(&mut data, ip_header_len, seq);
    packet::set_tcp_flags(&mut data, ip_header_len, flags);
    packet::set_ipv4_checksum_zero(&mut data);
    packet::set_tcp_checksum_zero(&mut data, ip_header_len);
    Packet {
        data,
        addr: addr.clone(),
        source: Source::Injected,
        ..Packet::default()
    }
}

/// First segment is `min(first_len, max_payload)` bytes; the rest is cut
/// into `max_payload`-sized slices. Returns an empty vec when the window
/// cannot produce at least two segments.
fn split_first(payload: &[u8], first_len: usize, max_payload: usize) -> Vec<&[u8]> {
    if max_payload < 1 || payload.is_empty() {
        return Vec::new();
    }
    let first_len = first_len.max(1).min(max_payload);
    if first_len >= payload.len() {
        return Vec::new();
    }

    let mut segments = Vec::with_capacity(2);
    segments.push(&payload[..first_len]);
    segments.extend(payload[first_len..].chunks(max_payload));
    segments
}

fn chunk_payload(payload: &[u8], max_payload: usize) -> Vec<&[u8]> {
    if max_payload < 1 || payload.is_empty() {
        return Vec::new();
    }
    payload.chunks(max_payload).collect()
}

/// Cap a fabricated segment's payload at the template's payload size, the
/// IPv4 total-length ceiling, and the configured per-segment cap (0 = no
/// cap).
fn clamp_segment_payload(payload_len: usize, header_len: usize, cap: usize) -> usize {
    if payload_len < 1 {
        return 0;
    }
    if header_len < 1 || header_len > MAX_IPV4_TOTAL_LEN {
        return 0;
    }
    let mut max_payload = payload_len.min(MAX_IPV4_TOTAL_LEN - header_len);
    if cap > 0 && max_payload > cap {
        max_payload = cap;
    }
    max_payload
}
