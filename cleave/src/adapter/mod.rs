//! Capture adapter contract.
//!
//! The engine and workers only ever touch this trait; the platform backends
//! (NFQUEUE on Linux, WinDivert on Windows, pf divert on FreeBSD) live in
//! their own compile-gated modules and are mutually exclusive at build time.

#[cfg(all(target_os = "freebsd", feature = "pf-divert"))]
pub mod divert;
#[cfg(all(target_os = "linux", feature = "nfqueue"))]
pub mod nfqueue;
#[cfg(all(target_os = "windows", feature = "windivert"))]
pub mod windivert;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::packet::Packet;

/// NFQUEUE parameters (Linux).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NfqueueOpts {
    /// NFQUEUE number the firewall rules steer :443 traffic into.
    pub queue_num: u16,
    /// Kernel-side queue length cap (0 = kernel default).
    pub queue_maxlen: u32,
    /// Bytes of each packet copied to userspace (0 = full packet).
    pub copy_range: u32,
    /// SO_MARK applied to reinjected packets so they bypass the queue rule.
    pub mark: u32,
}

impl Default for NfqueueOpts {
    fn default() -> Self {
        Self {
            queue_num: 100,
            queue_maxlen: 4096,
            copy_range: 0xffff,
            mark: 1,
        }
    }
}

/// WinDivert queue parameters (Windows). Zero means driver default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WinDivertOpts {
    pub queue_len: u64,
    pub queue_time: u64,
    pub queue_size: u64,
}

/// pf divert socket parameters (FreeBSD).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DivertOpts {
    /// Divert port matching the pf `divert-packet port` rule.
    pub port: u16,
}

impl Default for DivertOpts {
    fn default() -> Self {
        Self { port: 8668 }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The supplied cancellation fired while waiting.
    #[error("operation cancelled")]
    Cancelled,
    #[error("adapter not implemented")]
    NotImplemented,
    /// The capture handle is gone; no further packets will arrive.
    #[error("adapter closed")]
    Closed,
    #[error("adapter i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability surface over the platform capture mechanism.
///
/// `recv` must be cancel-safe: dropping its future at an await point must
/// not lose a captured packet.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Block until a packet is captured or `cancel` fires. `Ok(None)` means
    /// a spurious wake; callers retry.
    async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError>;

    /// For captured packets, deliver the "accept" verdict to the kernel.
    /// For fabricated packets, reinject into the stack. Consumes the packet.
    async fn send(&self, pkt: Packet) -> Result<(), AdapterError>;

    /// Deliver the "drop" verdict for a captured packet. Backends without
    /// per-packet verdicts make this a no-op: there the originals are
    /// discarded simply by never being reinjected.
    async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError>;

    /// Recompute IP and TCP checksums in place. Backends may use platform
    /// helpers; [`crate::packet::recompute_checksums`] is the software
    /// fallback.
    fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError>;

    /// Fail-open any packets sitting in adapter-level buffers by
    /// reinjecting/accepting them. The engine bounds the call with a
    /// timeout.
    async fn flush(&self) -> Result<(), AdapterError>;

    /// Release the capture handle. Idempotent.
    fn close(&self) -> Result<(), AdapterError>;
}

/// Placeholder backend for hosts built without a capture feature.
#[derive(Debug, Default)]
pub struct StubAdapter;

impl StubAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    async fn recv(&self, _cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
        Err(AdapterError::NotImplemented)
    }

    async fn send(&self, _pkt: Packet) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented)
    }

    async fn drop_packet(&self, _pkt: Packet) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented)
    }

    fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError> {
        crate::packet::recompute_checksums(&mut pkt.data);
        Ok(())
    }

    async fn flush(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::{mpsc, Mutex};

    use super::*;

    /// Scriptable in-memory adapter: tests feed captured packets through a
    /// channel and observe every send/drop in order.
    pub(crate) struct MockAdapter {
        pub sends: StdMutex<Vec<Packet>>,
        pub drops: StdMutex<Vec<Packet>>,
        recv_rx: Mutex<mpsc::Receiver<Packet>>,
        pub recv_error: StdMutex<Option<String>>,
        pub fail_sends: AtomicBool,
        pub flush_called: AtomicBool,
        pub flush_hang: AtomicBool,
        pub close_called: AtomicBool,
        pub close_before_flush: AtomicBool,
    }

    impl MockAdapter {
        pub(crate) fn new() -> (std::sync::Arc<Self>, mpsc::Sender<Packet>) {
            let (tx, rx) = mpsc::channel(1024);
            (
                std::sync::Arc::new(Self {
                    sends: StdMutex::new(Vec::new()),
                    drops: StdMutex::new(Vec::new()),
                    recv_rx: Mutex::new(rx),
                    recv_error: StdMutex::new(None),
                    fail_sends: AtomicBool::new(false),
                    flush_called: AtomicBool::new(false),
                    flush_hang: AtomicBool::new(false),
                    close_called: AtomicBool::new(false),
                    close_before_flush: AtomicBool::new(false),
                }),
                tx,
            )
        }

        pub(crate) fn sent_payloads(&self) -> Vec<Vec<u8>> {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .map(|p| {
                    let mut copy = Packet::captured(p.data.clone());
                    match crate::packet::decode(&mut copy) {
                        Ok(()) => copy.payload().to_vec(),
                        Err(_) => copy.data.clone(),
                    }
                })
                .collect()
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
            if let Some(msg) = self.recv_error.lock().unwrap().as_ref() {
                return Err(AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    msg.clone(),
                )));
            }
            let mut rx = self.recv_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => Err(AdapterError::Cancelled),
                maybe = rx.recv() => maybe.map(Some).ok_or(AdapterError::Closed),
            }
        }

        async fn send(&self, pkt: Packet) -> Result<(), AdapterError> {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "send refused",
                )));
            }
            self.sends.lock().unwrap().push(pkt);
            Ok(())
        }

        async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError> {
            self.drops.lock().unwrap().push(pkt);
            Ok(())
        }

        fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError> {
            crate::packet::recompute_checksums(&mut pkt.data);
            Ok(())
        }

        async fn flush(&self) -> Result<(), AdapterError> {
            self.flush_called.store(true, Ordering::Release);
            if self.flush_hang.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn close(&self) -> Result<(), AdapterError> {
            if !self.flush_called.load(Ordering::Acquire) {
                self.close_before_flush.store(true, Ordering::Release);
            }
            self.close_called.store(true, Ordering::Release);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_adapter_surface() {
        let stub = StubAdapter::new();
        let cancel = CancellationToken::new();

        assert!(matches!(
            stub.recv(&cancel).await,
            Err(AdapterError::NotImplemented)
        ));
        assert!(matches!(
            stub.send(Packet::default()).await,
            Err(AdapterError::NotImplemented)
        ));
        assert!(matches!(
            stub.drop_packet(Packet::default()).await,
            Err(AdapterError::NotImplemented)
        ));
        assert!(stub.flush().await.is_ok());
        assert!(stub.close().is_ok());
        assert!(stub.close().is_ok());
    }

    #[tokio::test]
    async fn stub_calc_checksums_uses_software_fallback() {
        let stub = StubAdapter::new();
        let mut pkt = Packet::captured(vec![0u8; 40]);
        pkt.data[0] = 0x45;
        pkt.data[2..4].copy_from_slice(&40u16.to_be_bytes());
        pkt.data[9] = 6;
        pkt.data[32] = 0x50;
        stub.calc_checksums(&mut pkt).unwrap();
        assert_ne!(u16::from_be_bytes([pkt.data[10], pkt.data[11]]), 0);
    }
}
