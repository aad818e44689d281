// Copyright 2025-2026 CEMAXECUTER LLC

//! UDP listener for the IQ data stream.
//!
//! A dedicated thread spins on a non-blocking socket, writing each
//! fixed-size datagram into the next slot of the slab pool it currently
//! owns.  The consumer and the listener exchange the two pools through a
//! pair of capacity-1 channels: handing the drained pool back *is* the
//! generation-switch request, and the filled pool comes back with its
//! packet count.  The capture thread never blocks on the consumer.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::pool::AlignedPool;
use crate::{operator_token, OVERFLOW_MSG};

/// Packets buffered per generation.  Total capture memory is twice this
/// value times the packet size.
pub const NUM_BUFFS: usize = 64_000;

/// Size in bytes of the UDP packets to receive.
pub const PACKET_SIZE: usize = 4_000;

/// Requested kernel receive buffer (net.core.rmem_max permitting).
pub const RECV_BUFF_SIZE: usize = 50_000_000;

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub num_buffs: usize,
    pub packet_size: usize,
    pub recv_buff_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            num_buffs: NUM_BUFFS,
            packet_size: PACKET_SIZE,
            recv_buff_size: RECV_BUFF_SIZE,
        }
    }
}

/// One handed-off capture generation: the pool and how many of its slots
/// hold packets, in arrival order.
pub struct Generation {
    pub pool: AlignedPool,
    pub count: usize,
}

pub struct UdpCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    full_rx: Receiver<Generation>,
    empty_tx: Sender<AlignedPool>,
    spare: Option<AlignedPool>,
    local_addr: Option<SocketAddr>,
}

impl UdpCapture {
    /// Bind `ip:port` and start capturing.  A failed bind is not fatal:
    /// the listener comes up unbound and every fetch reports an empty
    /// generation, matching the rest of the pipeline's "run but produce
    /// nothing" recovery policy.
    pub fn new(ip: &str, port: u16, cfg: CaptureConfig) -> Result<Self, String> {
        let pool_a = AlignedPool::new(cfg.num_buffs, cfg.packet_size)?;
        let pool_b = AlignedPool::new(cfg.num_buffs, cfg.packet_size)?;

        let running = Arc::new(AtomicBool::new(true));
        let (full_tx, full_rx) = bounded::<Generation>(1);
        let (empty_tx, empty_rx) = bounded::<AlignedPool>(1);

        let socket = match UdpSocket::bind((ip, port)) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to bind IQ socket {}:{}: {}", ip, port, e);
                return Ok(Self {
                    running,
                    handle: None,
                    full_rx,
                    empty_tx,
                    spare: Some(pool_b),
                    local_addr: None,
                });
            }
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| format!("failed to set IQ socket non-blocking: {}", e))?;
        set_recv_buffer(&socket, cfg.recv_buff_size);
        let local_addr = socket.local_addr().ok();

        let flag = running.clone();
        let packet_size = cfg.packet_size;
        let handle = std::thread::spawn(move || {
            capture_loop(socket, pool_a, packet_size, empty_rx, full_tx, flag);
        });

        Ok(Self {
            running,
            handle: Some(handle),
            full_rx,
            empty_tx,
            spare: Some(pool_b),
            local_addr,
        })
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Request a generation switch and wait for the filled pool.  Returns
    /// `None` when unbound, stopping, or when the listener does not answer
    /// within `timeout`.
    pub fn fetch(&mut self, timeout: Duration) -> Option<Generation> {
        if !self.is_bound() || !self.running.load(Ordering::Acquire) {
            return None;
        }
        if let Some(pool) = self.spare.take() {
            match self.empty_tx.try_send(pool) {
                Ok(()) => {}
                Err(TrySendError::Full(p)) | Err(TrySendError::Disconnected(p)) => {
                    self.spare = Some(p);
                }
            }
        }
        self.full_rx.recv_timeout(timeout).ok()
    }

    /// Give a drained pool back; the next `fetch` offers it to the
    /// listener as the switch request.
    pub fn recycle(&mut self, pool: AlignedPool) {
        self.spare = Some(pool);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    socket: UdpSocket,
    mut pool: AlignedPool,
    packet_size: usize,
    empty_rx: Receiver<AlignedPool>,
    full_tx: Sender<Generation>,
    running: Arc<AtomicBool>,
) {
    let num_buffs = pool.len();
    let mut index = 0usize;
    let mut overflow = false;

    while running.load(Ordering::Acquire) {
        match socket.recv(pool.at_mut(index)) {
            Ok(n) if n == packet_size => {
                index += 1;
                if index >= num_buffs {
                    overflow = true;
                    index = 0;
                }
            }
            // Runt or oversized datagram: reuse the slot.
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("IQ recv error: {}", e);
                break;
            }
        }

        if let Ok(next) = empty_rx.try_recv() {
            if overflow {
                operator_token(OVERFLOW_MSG);
                overflow = false;
            }
            let filled = std::mem::replace(&mut pool, next);
            let count = index;
            index = 0;
            match full_tx.try_send(Generation { pool: filled, count }) {
                Ok(()) => {}
                // Consumer went away mid-handoff; reclaim and keep going.
                Err(TrySendError::Full(g)) | Err(TrySendError::Disconnected(g)) => {
                    pool = g.pool;
                }
            }
        }
    }
}

fn set_recv_buffer(socket: &UdpSocket, bytes: usize) {
    let fd = socket.as_raw_fd();
    let val = bytes as libc::c_int;
    // SAFETY: fd is a live socket and the option value points at a local int.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::warn!("failed to set socket receive buffer to {}", bytes);
    }
}
