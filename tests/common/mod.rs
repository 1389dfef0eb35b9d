//! Shared harness for the engine integration tests: build a receiver from
//! an `--rx` style spec string, run it on its own thread, and talk to it
//! over real sockets with the frame protocol.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ringmark::cli::{build_receivers, RunPlan};
use ringmark::config::parse_rx_spec;

/// Encode one request frame.
pub fn frame(reply_size: u32, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + payload.len());
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(&reply_size.to_le_bytes());
    v.extend_from_slice(payload);
    v
}

pub struct RunningReceiver {
    pub port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<ringmark::Result<()>>>,
}

/// Build the receiver described by `spec` on `port` and run it on a
/// background thread.
pub fn launch_spec(spec: &str, port: u16) -> ringmark::Result<RunningReceiver> {
    let plan = RunPlan {
        rx: vec![parse_rx_spec(spec)?],
        use_port: vec![port],
        v6: false,
        print_rx_stats: false,
        print_read_stats: false,
    };
    let mut receivers = build_receivers(&plan)?;
    let receiver = receivers.remove(0);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let mut runner = receiver.runner;
    let handle = std::thread::spawn(move || runner.run(&flag));

    Ok(RunningReceiver {
        port: receiver.port,
        shutdown,
        handle: Some(handle),
    })
}

impl RunningReceiver {
    /// Connect to the receiver, retrying while the listener comes up.
    pub fn connect(&self) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)) {
                stream.set_nodelay(true).expect("set_nodelay");
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .expect("set_read_timeout");
                return stream;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("could not connect to receiver on port {}", self.port);
    }

    /// Signal shutdown and wait for the engine to exit.
    pub fn stop(mut self) -> ringmark::Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().expect("receiver thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for RunningReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Read exactly `n` reply bytes.
pub fn read_reply(stream: &mut TcpStream, n: usize) {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("reply truncated");
}

/// Expect no reply bytes within a short window.
pub fn assert_no_reply_yet(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(30)))
        .expect("set_read_timeout");
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => panic!("receiver closed the connection early"),
        Ok(_) => panic!("receiver replied before the frame completed"),
        Err(e) => assert!(
            matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "unexpected read error: {e}"
        ),
    }
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set_read_timeout");
}

/// Write a request stream and consume the expected replies.
pub fn roundtrip(stream: &mut TcpStream, requests: &[(u32, Vec<u8>)]) {
    let mut wire = Vec::new();
    let mut owed = 0usize;
    for (reply_size, payload) in requests {
        wire.extend(frame(*reply_size, payload));
        owed += *reply_size as usize;
    }
    stream.write_all(&wire).expect("request write failed");
    read_reply(stream, owed);
}
