// Copyright 2025-2026 CEMAXECUTER LLC

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Blocking mnemonic client.  Commands are ASCII lines terminated by
/// CRLF; a mutex keeps a send and its optional reply paired on the
/// single socket.
pub struct MnemonicClient {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl MnemonicClient {
    pub fn connect(ip: &str, port: u16) -> Result<Self, String> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|e| format!("bad control address {}:{}: {}", ip, port, e))?;
        log::info!("attempting to connect to the radio at {}", addr);
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| format!("TCP connection to {} failed: {}", addr, e))?;
        log::info!("connected");
        Ok(Self {
            stream: Mutex::new(stream),
            peer: addr,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one command line, no reply expected.
    pub fn send(&self, line: &str) -> Result<(), String> {
        let mut stream = self.stream.lock().unwrap();
        write_line(&mut stream, line)
    }

    /// Send one command line and wait up to `timeout_s` seconds for a
    /// reply.  A quiet radio yields an empty string, not an error.
    pub fn send_and_read(&self, line: &str, timeout_s: u64) -> Result<String, String> {
        let mut stream = self.stream.lock().unwrap();
        write_line(&mut stream, line)?;
        stream
            .set_read_timeout(Some(Duration::from_secs(timeout_s.max(1))))
            .map_err(|e| format!("failed to set control read timeout: {}", e))?;
        let mut buf = [0u8; 256];
        match stream.read(&mut buf) {
            Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(String::new())
            }
            Err(e) => Err(format!("control read failed: {}", e)),
        }
    }
}

fn write_line(stream: &mut TcpStream, line: &str) -> Result<(), String> {
    let framed = format!("{}\r\n", line);
    stream
        .write_all(framed.as_bytes())
        .map_err(|e| format!("control send failed: {}", e))
}
