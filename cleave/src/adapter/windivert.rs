//! Windows WinDivert backend.
//!
//! Binds `WinDivert.dll` at runtime and drives its blocking recv/send pair
//! from `spawn_blocking`. WinDivert has no per-packet drop verdict: a
//! captured packet is dropped simply by never being re-sent, so
//! `drop_packet` is a no-op and the split path works purely by sending
//! fabricated packets.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use libloading::Library;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Adapter, AdapterError, WinDivertOpts};
use crate::packet::{self, Address, Packet, Source};

/// Filter matching outbound IPv4 TCP traffic to port 443.
const FILTER: &str = "outbound and ip and tcp.DstPort == 443";

const LAYER_NETWORK: i32 = 0;

type OpenFn = unsafe extern "system" fn(*const u8, i32, i16, u64) -> isize;
type RecvFn = unsafe extern "system" fn(isize, *mut c_void, u32, *mut u32, *mut c_void) -> i32;
type SendFn = unsafe extern "system" fn(isize, *const c_void, u32, *mut u32, *const c_void) -> i32;
type CalcFn = unsafe extern "system" fn(*mut c_void, u32, *mut c_void, u64) -> i32;
type CloseFn = unsafe extern "system" fn(isize) -> i32;

struct Dll {
    _lib: Library,
    open: OpenFn,
    recv: RecvFn,
    send: SendFn,
    calc: CalcFn,
    close: CloseFn,
}

pub struct WinDivertAdapter {
    dll: Arc<Dll>,
    handle: isize,
    closed: AtomicBool,
}

// The WinDivert handle is documented as safe for concurrent use.
unsafe impl Send for WinDivertAdapter {}
unsafe impl Sync for WinDivertAdapter {}

impl WinDivertAdapter {
    pub fn new(opts: &WinDivertOpts) -> Result<Self, AdapterError> {
        let lib = unsafe { Library::new("WinDivert.dll") }
            .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let dll = unsafe {
            Dll {
                open: *lib
                    .get::<OpenFn>(b"WinDivertOpen")
                    .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
                recv: *lib
                    .get::<RecvFn>(b"WinDivertRecvEx")
                    .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
                send: *lib
                    .get::<SendFn>(b"WinDivertSendEx")
                    .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
                calc: *lib
                    .get::<CalcFn>(b"WinDivertHelperCalcChecksums")
                    .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
                close: *lib
                    .get::<CloseFn>(b"WinDivertClose")
                    .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
                _lib: lib,
            }
        };

        let mut filter = FILTER.as_bytes().to_vec();
        filter.push(0);
        let handle = unsafe { (dll.open)(filter.as_ptr(), LAYER_NETWORK, 0, 0) };
        if handle == -1 || handle == 0 {
            return Err(AdapterError::Io(std::io::Error::last_os_error()));
        }
        debug!(
            event.name = "windivert.opened",
            queue_len = opts.queue_len,
            queue_time = opts.queue_time,
        );

        Ok(Self {
            dll: Arc::new(dll),
            handle,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Adapter for WinDivertAdapter {
    async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
        let dll = self.dll.clone();
        let handle = self.handle;
        let blocking = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; 0xffff];
            let mut addr = Address::default();
            let mut read: u32 = 0;
            let ok = unsafe {
                (dll.recv)(
                    handle,
                    buf.as_mut_ptr().cast(),
                    buf.len() as u32,
                    &mut read,
                    addr.data.as_mut_ptr().cast(),
                )
            };
            if ok == 0 {
                return Err(AdapterError::Io(std::io::Error::last_os_error()));
            }
            buf.truncate(read as usize);
            let mut pkt = Packet::captured(buf);
            pkt.addr = addr;
            Ok(pkt)
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            joined = blocking => match joined {
                Ok(res) => res.map(Some),
                Err(_) => Err(AdapterError::Closed),
            },
        }
    }

    async fn send(&self, pkt: Packet) -> Result<(), AdapterError> {
        let dll = self.dll.clone();
        let handle = self.handle;
        let joined = tokio::task::spawn_blocking(move || {
            let mut written: u32 = 0;
            let ok = unsafe {
                (dll.send)(
                    handle,
                    pkt.data.as_ptr().cast(),
                    pkt.data.len() as u32,
                    &mut written,
                    pkt.addr.data.as_ptr().cast(),
                )
            };
            if ok == 0 {
                return Err(AdapterError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        })
        .await;
        joined.map_err(|_| AdapterError::Closed)?
    }

    /// WinDivert never re-delivers originals; discarding is the drop.
    async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError> {
        debug_assert_eq!(pkt.source, Source::Captured);
        Ok(())
    }

    fn calc_checksums(&self, pkt: &mut Packet) -> Result<(), AdapterError> {
        let ok = unsafe {
            (self.dll.calc)(
                pkt.data.as_mut_ptr().cast(),
                pkt.data.len() as u32,
                pkt.addr.data.as_mut_ptr().cast(),
                0,
            )
        };
        if ok == 0 {
            // The helper refuses malformed input; fall back to software.
            packet::recompute_checksums(&mut pkt.data);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), AdapterError> {
        // Captured packets not yet received are released by closing the
        // handle; there is no adapter-level buffer of our own to drain.
        Ok(())
    }

    fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        unsafe { (self.dll.close)(self.handle) };
        Ok(())
    }
}

impl Drop for WinDivertAdapter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
