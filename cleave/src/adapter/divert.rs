//! FreeBSD pf divert backend.
//!
//! A divert socket is a plain datagram socket: packets matched by a pf
//! `divert-packet port` rule arrive via `recvfrom`, and writing a packet
//! back with the recorded sockaddr reinserts it into the stack. There is
//! no per-packet drop verdict; like WinDivert, a packet is dropped by
//! never being written back.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Adapter, AdapterError, DivertOpts};
use crate::packet::{self, Address, Packet, Source};

pub struct DivertAdapter {
    fd: i32,
    closed: AtomicBool,
}

impl DivertAdapter {
    pub fn new(opts: &DivertOpts) -> Result<Self, AdapterError> {
        let fd = unsafe { libc::socket(libc::PF_INET, libc::SOCK_RAW, libc::IPPROTO_DIVERT) };
        if fd < 0 {
            return Err(AdapterError::Io(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
        addr.sin_family = libc::AF_INET as u8;
        addr.sin_port = opts.port.to_be();
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(AdapterError::Io(err));
        }
        debug!(event.name = "divert.bound", port = opts.port);
        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    fn recv_blocking(fd: i32) -> Result<Packet, AdapterError> {
        let mut buf = vec![0u8; 0xffff];
        let mut addr = Address::default();
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                addr.data.as_mut_ptr().cast(),
                &mut addr_len,
            )
        };
        if n < 0 {
            return Err(AdapterError::Io(io::Error::last_os_error()));
        }
        buf.truncate(n as usize);
        let mut pkt = Packet::captured(buf);
        pkt.addr = addr;
        Ok(pkt)
    }

    fn send_blocking(fd: i32, pkt: &Packet) -> Result<(), AdapterError> {
        let n = unsafe {
            libc::sendto(
                fd,
                pkt.data.as_ptr().cast(),
                pkt.data.len(),
                0,
                pkt.addr.data.as_ptr().cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(AdapterError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for DivertAdapter {
    async fn recv(&self, cancel: &CancellationToken) -> Result<Option<Packet>, AdapterError> {
        let fd = self.fd;
        let blocking = tokio::task::spawn_blocking(move || Self::recv_blocking(fd));
        tokio::select! {
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            joined = blocking => match joined {
                Ok(res) => res.map(Some),
                Err(_) => Err(AdapterError::Closed),
            },
        }
    }

    async fn send(&self, pkt: Packet) -> Result<(), AdapterError> {
        let fd = self.fd;
        let joined = tokio::task::spawn_blocking(move || Self::send_blocking(fd, &pkt)).await;
        joined.map_err(|_| AdapterError::Closed)?
    }

    /// Divert sockets re-deliver nothing; discarding is the drop.
    async fn drop_packet(&self, pkt: Packet) -> Result<(), AdapterError> {
        debug_assert_eq!(pkt.source, Source::Captured);
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
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        unsafe { libc::close(self.fd) };
        Ok(())
    }
}

impl Drop for DivertAdapter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

