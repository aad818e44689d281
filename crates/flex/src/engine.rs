// Copyright 2025-2026 CEMAXECUTER LLC

//! Thread wiring for the flex pipeline: one receive thread filling the
//! byte arenas, one process thread draining them through the frame
//! assembler.  The consumer talks to the pipeline only through the
//! shared `ListExchange`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::assembler::{AssemblerConfig, FrameAssembler, ListExchange};
use crate::receiver::{FlexReceiver, ReceiverConfig};

/// How long the process thread waits for the receiver before advancing
/// the flip state machine on its own.
const PROCESS_WAIT: Duration = Duration::from_millis(1);

pub struct FlexEngine {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    exchange: Arc<ListExchange>,
    local_addr: Option<SocketAddr>,
}

impl FlexEngine {
    pub fn new(ip: &str, port: u16) -> Self {
        Self::with_config(ip, port, ReceiverConfig::default(), AssemblerConfig::default())
    }

    pub fn with_config(
        ip: &str,
        port: u16,
        recv_cfg: ReceiverConfig,
        asm_cfg: AssemblerConfig,
    ) -> Self {
        let exchange = Arc::new(ListExchange::new());
        let running = Arc::new(AtomicBool::new(true));

        let mut receiver = FlexReceiver::with_config(ip, port, recv_cfg);
        let local_addr = receiver.local_addr();
        let flag = running.clone();
        let asm_exchange = exchange.clone();
        let handle = std::thread::spawn(move || {
            let mut assembler = FrameAssembler::with_config(asm_exchange, asm_cfg);
            while flag.load(Ordering::Acquire) {
                match receiver.fetch(PROCESS_WAIT) {
                    Some(block) => {
                        for chunk in block.chunks() {
                            assembler.parse(chunk);
                        }
                        receiver.recycle(block);
                    }
                    // Idle link: still advance a pending list flip.
                    None => {
                        assembler.parse(&[]);
                    }
                }
            }
            receiver.stop();
        });

        Self {
            running,
            handle: Some(handle),
            exchange,
            local_addr,
        }
    }

    pub fn exchange(&self) -> Arc<ListExchange> {
        self.exchange.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlexEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
