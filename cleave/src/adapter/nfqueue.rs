//! Linux NFQUEUE backend.
//!
//! A dedicated capture thread owns the netlink queue: it copies captured
//! packets into a bounded channel and applies verdicts commanded by the
//! engine. Fabricated packets bypass the queue entirely and are written to
//! a raw `IPPROTO_RAW` socket with `IP_HDRINCL`, optionally tagged with
//! `SO_MARK` so the firewall rules do not re-queue them.
//!
//! Fail-open is built in at every seam: when the recv channel is full,
//! when a flush is in progress, and when the thread shuts down, pending
//! packets are verdict-accepted rather than left queued in the kernel.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel as cbc;
use nfq::{Queue, Verdict};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Adapter, AdapterError, NfqueueOpts};
use crate::packet::{self, Packet, Source};

const RECV_CHANNEL_CAPACITY: usize = 1024;

enum VerdictCmd {
    Accept(u32),
    Drop(u32),
    Shutdown,
}

pub struct NfqueueAdapter {
    recv_rx: Mutex<mpsc::Receiver<Packet>>,
    cmd_tx: cbc::Sender<VerdictCmd>,
    raw: Socket,
    flushing: Arc<AtomicBool>,
    closed: AtomicBool,
    capture: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl NfqueueAdapter {
    pub fn new(opts: &NfqueueOpts) -> Result<Self, AdapterError> {
        let mut queue = Queue::open()?;
        queue.bind(opts.queue_num)?;
        queue.set_nonblocking(true);

        let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc_raw())))?;
        raw.set_header_included(true)?;
        if opts.mark != 0 {
            raw.set_mark(opts.mark)?;
        }

        let (recv_tx, recv_rx) = mpsc::channel(RECV_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = cbc::unbounded();
        let flushing = Arc::new(AtomicBool::new(false));

        let thread_flushing = flushing.clone();
        let capture = thread::Builder::new()
            .name("cleave-nfqueue".into())
            .spawn(move || capture_loop(queue, recv_tx, cmd_rx, thread_flushing))
            .map_err(AdapterError::Io)?;

        Ok(Self {
            recv_rx: Mutex::new(recv_rx),
            cmd_tx,
            raw,
            flushing,
            closed: AtomicBool::new(false),
            capture: std::sync::Mutex::new(Some(capture)),
        })
    }

    fn inject(&self, pkt: &Packet) -> Result<(), AdapterError> {
        if pkt.data.len() < 20 {
            return Ok(());
        }
        let dst = Ipv4Addr::new(pkt.data[16], pkt.data[17], pkt.data[18], pkt.data[19]);
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        self.raw.send_to(&pkt.data, &addr)?;
        Ok(())
    }

    fn command(&self, cmd: VerdictCmd) -> Result<(), AdapterError> {
        self.cmd_tx.send(cmd).map_err(|_| AdapterError::Closed)
    }
}

#[async_trait]
impl Adapter for NfqueueAdapter {
    async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
        let mut rx = self.recv_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            maybe = rx.recv() => maybe.map(Some).ok_or(AdapterError::Closed),
        }
    }

    async fn send(&self, pkt: Packet) -> Result<(), AdapterError> {
        match pkt.source {
            Source::Captured => self.command(VerdictCmd::Accept(pkt.nfq_id)),
            _ => self.inject(&pkt),
        }
    }

    async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError> {
        if pkt.source != Source::Captured {
            return Ok(());
        }
        self.command(VerdictCmd::Drop(pkt.nfq_id))
    }

    fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError> {
        packet::recompute_checksums(&mut pkt.data);
        Ok(())
    }

    /// Accept everything already copied into the recv buffer. The capture
    /// thread additionally accepts at the source while the flag is up.
    async fn flush(&self) -> Result<(), AdapterError> {
        self.flushing.store(true, Ordering::Release);
        let mut rx = self.recv_rx.lock().await;
        let mut drained = 0usize;
        while let Ok(pkt) = rx.try_recv() {
            self.command(VerdictCmd::Accept(pkt.nfq_id))?;
            drained += 1;
        }
        if drained > 0 {
            debug!(event.name = "nfqueue.flush_drained", drained);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.cmd_tx.send(VerdictCmd::Shutdown);
        if let Ok(mut slot) = self.capture.lock() {
            if let Some(handle) = slot.take() {
                if handle.join().is_err() {
                    warn!(event.name = "nfqueue.capture_thread_panicked");
                }
            }
        }
        Ok(())
    }
}

impl Drop for NfqueueAdapter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The capture thread: nonblocking recv interleaved with verdict commands.
/// Owns the only handle to the netlink socket, so every verdict goes
/// through the command channel.
fn capture_loop(
    mut queue: Queue,
    recv_tx: mpsc::Sender<Packet>,
    cmd_rx: cbc::Receiver<VerdictCmd>,
    flushing: Arc<AtomicBool>,
) {
    let mut pending: HashMap<u32, nfq::Message> = HashMap::new();
    let mut next_id: u32 = 1;

    'outer: loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if apply_cmd(&mut queue, &mut pending, cmd) {
                break 'outer;
            }
        }

        match queue.recv() {
            Ok(mut msg) => {
                if flushing.load(Ordering::Acquire) {
                    msg.set_verdict(Verdict::Accept);
                    let _ = queue.verdict(msg);
                    continue;
                }
                let data = msg.get_payload().to_vec();
                let id = next_id;
                next_id = next_id.wrapping_add(1);
                let mut pkt = Packet::captured(data);
                pkt.nfq_id = id;
                match recv_tx.try_send(pkt) {
                    Ok(()) => {
                        pending.insert(id, msg);
                    }
                    // Backpressure or shutdown: never hold the packet.
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        msg.set_verdict(Verdict::Accept);
                        let _ = queue.verdict(msg);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        msg.set_verdict(Verdict::Accept);
                        let _ = queue.verdict(msg);
                        break 'outer;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match cmd_rx.recv_timeout(Duration::from_millis(1)) {
                    Ok(cmd) => {
                        if apply_cmd(&mut queue, &mut pending, cmd) {
                            break 'outer;
                        }
                    }
                    Err(cbc::RecvTimeoutError::Timeout) => {}
                    Err(cbc::RecvTimeoutError::Disconnected) => break 'outer,
                }
            }
            Err(e) => {
                warn!(event.name = "nfqueue.recv_failed", error.message = %e);
                break 'outer;
            }
        }
    }

    // Nothing may stay queued in the kernel past the thread's lifetime.
    for (_, mut msg) in pending.drain() {
        msg.set_verdict(Verdict::Accept);
        let _ = queue.verdict(msg);
    }
}

/// Returns true when the command asks the thread to stop.
fn apply_cmd(
    queue: &mut Queue,
    pending: &mut HashMap<u32, nfq::Message>,
    cmd: VerdictCmd,
) -> bool {
    match cmd {
        VerdictCmd::Accept(id) => {
            if let Some(mut msg) = pending.remove(&id) {
                msg.set_verdict(Verdict::Accept);
                let _ = queue.verdict(msg);
            }
            false
        }
        VerdictCmd::Drop(id) => {
            if let Some(mut msg) = pending.remove(&id) {
                msg.set_verdict(Verdict::Drop);
                let _ = queue.verdict(msg);
            }
            false
        }
        VerdictCmd::Shutdown => true,
    }
}

fn libc_raw() -> i32 {
    // IPPROTO_RAW; spelled out to avoid a libc dependency for one constant.
    255
}
