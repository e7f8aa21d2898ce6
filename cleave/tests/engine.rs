//! End-to-end pipeline scenarios over a scripted adapter: packets are fed
//! through the capture side and every verdict the engine takes is recorded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use cleave::adapter::{Adapter, AdapterError};
use cleave::engine::Engine;
use cleave::packet::{self, Packet, Source};
use cleave::runtime::conf::EngineConf;

struct ScriptedAdapter {
    sends: StdMutex<Vec<Packet>>,
    drops: StdMutex<Vec<Packet>>,
    recv_rx: Mutex<mpsc::Receiver<Packet>>,
    closed: AtomicBool,
}

impl ScriptedAdapter {
    fn new() -> (Arc<Self>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                sends: StdMutex::new(Vec::new()),
                drops: StdMutex::new(Vec::new()),
                recv_rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
            }),
            tx,
        )
    }

    fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    fn drop_count(&self) -> usize {
        self.drops.lock().unwrap().len()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
        let mut rx = self.recv_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            maybe = rx.recv() => maybe.map(Some).ok_or(AdapterError::Closed),
        }
    }

    async fn send(&self, pkt: Packet) -> Result<(), AdapterError> {
        self.sends.lock().unwrap().push(pkt);
        Ok(())
    }

    async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError> {
        self.drops.lock().unwrap().push(pkt);
        Ok(())
    }

    fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError> {
        packet::recompute_checksums(&mut pkt.data);
        Ok(())
    }

    async fn flush(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn close(&self) -> Result<(), AdapterError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn build_ipv4_tcp(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; 40 + payload.len()];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    buf[8] = 64;
    buf[9] = 6;
    buf[12..16].copy_from_slice(&src);
    buf[16..20].copy_from_slice(&dst);
    buf[20..22].copy_from_slice(&src_port.to_be_bytes());
    buf[22..24].copy_from_slice(&dst_port.to_be_bytes());
    buf[24..28].copy_from_slice(&seq.to_be_bytes());
    buf[32] = 0x50;
    buf[33] = flags;
    buf[34..36].copy_from_slice(&0xfaf0u16.to_be_bytes());
    buf[40..].copy_from_slice(payload);
    buf
}

/// 21-byte ClientHello record: 5-byte header plus a 16-byte body.
fn hello_record() -> Vec<u8> {
    let mut rec = vec![0x16, 0x03, 0x01, 0x00, 0x10, 0x01];
    rec.extend_from_slice(&[0u8; 15]);
    rec
}

fn decoded(data: &[u8]) -> Packet {
    let mut pkt = Packet::captured(data.to_vec());
    packet::decode(&mut pkt).unwrap();
    pkt
}

fn test_conf() -> EngineConf {
    EngineConf {
        workers: 1,
        adapter_flush_timeout: Duration::from_millis(100),
        shutdown_fail_open_timeout: Duration::from_millis(500),
        ..EngineConf::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn splits_client_hello_end_to_end() {
    let (adapter, feed) = ScriptedAdapter::new();
    let engine = Arc::new(Engine::new(test_conf(), adapter.clone()));

    let shutdown = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let hello = build_ipv4_tcp(
        [10, 0, 0, 2],
        [93, 184, 216, 34],
        40000,
        443,
        1000,
        0x18,
        &hello_record(),
    );
    feed.send(Packet::captured(hello)).await.unwrap();

    wait_until(|| adapter.drop_count() == 1 && adapter.send_count() == 2).await;

    {
        let sends = adapter.sends.lock().unwrap();
        let first = decoded(&sends[0].data);
        let second = decoded(&sends[1].data);
        assert_eq!(sends[0].source, Source::Injected);
        assert_eq!(sends[1].source, Source::Injected);
        assert_eq!(first.payload().len(), 5);
        assert_eq!(second.payload().len(), 16);
        assert_eq!(first.meta.seq, 1000);
        assert_eq!(second.meta.seq, 1005);

        let mut joined = first.payload().to_vec();
        joined.extend_from_slice(second.payload());
        assert_eq!(joined, hello_record());

        // Emitted checksums are already valid.
        for sent in sends.iter() {
            let mut copy = sent.data.clone();
            packet::recompute_checksums(&mut copy);
            assert_eq!(copy, sent.data);
        }

        let drops = adapter.drops.lock().unwrap();
        assert_eq!(drops[0].source, Source::Captured);
    }

    shutdown.cancel();
    run.await.unwrap().unwrap();
    assert!(adapter.closed.load(Ordering::Acquire));
}

#[tokio::test]
async fn non_target_traffic_passes_through_untouched() {
    let (adapter, feed) = ScriptedAdapter::new();
    let engine = Arc::new(Engine::new(test_conf(), adapter.clone()));

    let shutdown = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    // Port 80 traffic.
    let http = build_ipv4_tcp([10, 0, 0, 2], [1, 2, 3, 4], 40000, 80, 1, 0x18, b"GET /");
    // An IPv4 fragment destined for 443 (MF bit set): decode rejects it.
    let mut frag = build_ipv4_tcp([10, 0, 0, 2], [1, 2, 3, 4], 40001, 443, 1, 0x18, b"x");
    frag[6..8].copy_from_slice(&0x2000u16.to_be_bytes());
    // Not parseable at all.
    let garbage = vec![0xff; 10];

    for data in [http.clone(), frag.clone(), garbage.clone()] {
        feed.send(Packet::captured(data)).await.unwrap();
    }

    wait_until(|| adapter.send_count() == 3).await;
    {
        let sends = adapter.sends.lock().unwrap();
        assert_eq!(sends[0].data, http);
        assert_eq!(sends[1].data, frag);
        assert_eq!(sends[2].data, garbage);
        for sent in sends.iter() {
            assert_eq!(sent.source, Source::Captured);
        }
    }
    assert_eq!(adapter.drop_count(), 0);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn ack_only_packets_take_the_fast_path() {
    let (adapter, feed) = ScriptedAdapter::new();
    let engine = Arc::new(Engine::new(test_conf(), adapter.clone()));

    let shutdown = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    // Pure ACK to :443, no payload: forwarded immediately, no flow state.
    let ack = build_ipv4_tcp(
        [10, 0, 0, 2],
        [93, 184, 216, 34],
        40000,
        443,
        999,
        0x10,
        &[],
    );
    feed.send(Packet::captured(ack.clone())).await.unwrap();

    wait_until(|| adapter.send_count() == 1).await;
    assert_eq!(adapter.sends.lock().unwrap()[0].data, ack);
    assert_eq!(adapter.drop_count(), 0);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn mismatching_first_payload_fails_open() {
    let (adapter, feed) = ScriptedAdapter::new();
    let engine = Arc::new(Engine::new(test_conf(), adapter.clone()));

    let shutdown = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    // A TLS alert record, not a handshake: released unchanged.
    let alert = build_ipv4_tcp(
        [10, 0, 0, 2],
        [93, 184, 216, 34],
        40000,
        443,
        1000,
        0x18,
        &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28],
    );
    feed.send(Packet::captured(alert.clone())).await.unwrap();

    wait_until(|| adapter.send_count() == 1).await;
    {
        let sends = adapter.sends.lock().unwrap();
        assert_eq!(sends[0].data, alert);
        assert_eq!(sends[0].source, Source::Captured);
    }
    assert_eq!(adapter.drop_count(), 0);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn hello_split_across_packets_waits_for_full_record() {
    let (adapter, feed) = ScriptedAdapter::new();
    let engine = Arc::new(Engine::new(test_conf(), adapter.clone()));

    let shutdown = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let record = hello_record();
    let part1 = build_ipv4_tcp(
        [10, 0, 0, 2],
        [93, 184, 216, 34],
        40000,
        443,
        1000,
        0x10,
        &record[..10],
    );
    let part2 = build_ipv4_tcp(
        [10, 0, 0, 2],
        [93, 184, 216, 34],
        40000,
        443,
        1010,
        0x18,
        &record[10..],
    );

    feed.send(Packet::captured(part1)).await.unwrap();
    // Nothing is emitted while the record is incomplete.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.send_count(), 0);

    feed.send(Packet::captured(part2)).await.unwrap();
    wait_until(|| adapter.drop_count() == 2 && adapter.send_count() >= 2).await;

    {
        let sends = adapter.sends.lock().unwrap();
        let mut joined = Vec::new();
        for sent in sends.iter() {
            assert_eq!(sent.source, Source::Injected);
            joined.extend_from_slice(decoded(&sent.data).payload());
        }
        assert_eq!(joined, record);
        let first = decoded(&sends[0].data);
        assert_eq!(first.payload().len(), 5);
    }

    shutdown.cancel();
    run.await.unwrap().unwrap();
}
