//! End-to-end tests for the readiness engine over localhost.

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicU16, Ordering};

use common::{assert_no_reply_yet, frame, launch_spec, read_reply, roundtrip};

static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

fn port() -> u16 {
    17_100 + NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

#[test]
fn test_single_frame_single_reply() {
    let rx = launch_spec("epoll", port()).expect("engine construction failed");
    let mut stream = rx.connect();
    stream.write_all(&frame(1, b"ping")).unwrap();
    read_reply(&mut stream, 1);
    drop(stream);
    rx.stop().unwrap();
}

#[test]
fn test_two_frames_in_one_segment() {
    // (length=0, reply=1) then (length=3, reply=2) in one write: 3 reply
    // bytes total.
    let rx = launch_spec("epoll", port()).expect("engine construction failed");
    let mut stream = rx.connect();
    let mut wire = frame(1, b"");
    wire.extend(frame(2, b"abc"));
    stream.write_all(&wire).unwrap();
    read_reply(&mut stream, 3);
    drop(stream);
    rx.stop().unwrap();
}

#[test]
fn test_no_reply_until_frame_completes() {
    let rx = launch_spec("epoll", port()).expect("engine construction failed");
    let mut stream = rx.connect();
    let wire = frame(1, b"12345678");
    for &b in &wire[..wire.len() - 1] {
        stream.write_all(&[b]).unwrap();
        assert_no_reply_yet(&mut stream);
    }
    stream.write_all(&wire[wire.len() - 1..]).unwrap();
    read_reply(&mut stream, 1);
    drop(stream);
    rx.stop().unwrap();
}

#[test]
fn test_reply_sizes_match_declarations() {
    let rx = launch_spec("epoll", port()).expect("engine construction failed");
    let mut stream = rx.connect();
    let requests: Vec<(u32, Vec<u8>)> =
        (1..=5u32).map(|r| (r, vec![0x55; r as usize * 3])).collect();
    roundtrip(&mut stream, &requests);
    // The stream is quiet again: a further frame gets exactly its reply.
    roundtrip(&mut stream, &[(4, b"tail".to_vec())]);
    drop(stream);
    rx.stop().unwrap();
}

#[test]
fn test_batch_send_mode() {
    let rx = launch_spec("epoll batch_send=1", port()).expect("engine construction failed");
    let mut streams: Vec<_> = (0..4).map(|_| rx.connect()).collect();
    for stream in &mut streams {
        stream.write_all(&frame(2, b"hello")).unwrap();
    }
    for stream in &mut streams {
        read_reply(stream, 2);
    }
    drop(streams);
    rx.stop().unwrap();
}

#[test]
fn test_recvmsg_mode() {
    let rx = launch_spec("epoll recvmsg=1", port()).expect("engine construction failed");
    let mut stream = rx.connect();
    roundtrip(&mut stream, &[(3, vec![7u8; 100])]);
    drop(stream);
    rx.stop().unwrap();
}

#[test]
fn test_many_frames_across_connections() {
    let rx = launch_spec("epoll", port()).expect("engine construction failed");
    const CONNS: usize = 4;
    const FRAMES: usize = 200;

    let mut streams: Vec<_> = (0..CONNS).map(|_| rx.connect()).collect();
    let mut wire = Vec::new();
    for _ in 0..FRAMES {
        wire.extend(frame(1, &[0xab; 64]));
    }
    for stream in &mut streams {
        stream.write_all(&wire).unwrap();
    }
    for stream in &mut streams {
        read_reply(stream, FRAMES);
    }
    drop(streams);
    rx.stop().unwrap();
}
