// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Full-stack smoke tests: sender and receiver contexts talking over
//! real loopback sockets, handshake and all.

use std::time::{Duration, Instant};

use rist::url::parse_rist_url;
use rist::{ContextConfig, DataBlock, Error, ReceiverCtx, SenderCtx};

fn free_port() -> u16 {
    // Bind an ephemeral socket just to reserve a port number.
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    let port = socket.local_addr().expect("addr").port();
    drop(socket);
    port
}

fn read_n(receiver: &ReceiverCtx, n: usize, deadline: Duration) -> Vec<DataBlock> {
    let start = Instant::now();
    let mut blocks = Vec::new();
    while blocks.len() < n && start.elapsed() < deadline {
        match receiver.read(Duration::from_millis(100)) {
            Ok(block) => blocks.push(block),
            Err(Error::Timeout) => {}
            Err(e) => panic!("read failed: {}", e),
        }
    }
    blocks
}

#[test]
fn clear_stream_over_loopback() {
    let port = free_port();

    let receiver = ReceiverCtx::new(ContextConfig::default());
    let listen = parse_rist_url(&format!("rist://@127.0.0.1:{}", port)).expect("url");
    receiver.peer_create(&listen).expect("peer");
    receiver.start().expect("receiver start");

    let sender = SenderCtx::new(ContextConfig::default());
    let out = parse_rist_url(&format!("rist://127.0.0.1:{}", port)).expect("url");
    sender.peer_create(&out).expect("peer");
    sender.start().expect("sender start");

    // Give the handshake a moment, then stream.
    std::thread::sleep(Duration::from_millis(300));
    let total = 200usize;
    for i in 0..total {
        let mut payload = vec![0x47u8; 188];
        payload[4] = (i & 0xFF) as u8;
        sender
            .write(DataBlock {
                payload,
                ..DataBlock::default()
            })
            .expect("write");
        // Modest pacing keeps the bounded queues comfortable.
        if i % 20 == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    let blocks = read_n(&receiver, total, Duration::from_secs(10));
    assert_eq!(blocks.len(), total, "stream did not arrive intact");
    for pair in blocks.windows(2) {
        assert_eq!(
            pair[1].seq,
            pair[0].seq.wrapping_add(1),
            "out-of-order or gapped delivery"
        );
    }
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.payload.len(), 188);
        assert_eq!(block.payload[4], (i & 0xFF) as u8, "payload corrupted");
    }

    sender.destroy();
    receiver.destroy();
}

#[test]
fn encrypted_stream_over_loopback() {
    let port = free_port();

    let receiver = ReceiverCtx::new(ContextConfig::default());
    let listen = parse_rist_url(&format!(
        "rist://@127.0.0.1:{}?secret=hunter2&aes-type=128",
        port
    ))
    .expect("url");
    receiver.peer_create(&listen).expect("peer");
    receiver.start().expect("receiver start");

    let sender = SenderCtx::new(ContextConfig::default());
    let out = parse_rist_url(&format!(
        "rist://127.0.0.1:{}?secret=hunter2&aes-type=128",
        port
    ))
    .expect("url");
    sender.peer_create(&out).expect("peer");
    sender.start().expect("sender start");

    std::thread::sleep(Duration::from_millis(300));
    let total = 100usize;
    for _ in 0..total {
        sender
            .write(DataBlock {
                payload: vec![0x47u8; 188],
                ..DataBlock::default()
            })
            .expect("write");
        std::thread::sleep(Duration::from_millis(1));
    }

    let blocks = read_n(&receiver, total, Duration::from_secs(10));
    assert_eq!(blocks.len(), total, "encrypted stream did not survive");
    for block in &blocks {
        assert_eq!(block.payload, vec![0x47u8; 188], "decrypt mismatch");
    }

    sender.destroy();
    receiver.destroy();
}

#[test]
fn destroy_wakes_blocked_reader() {
    let port = free_port();
    let receiver = ReceiverCtx::new(ContextConfig::default());
    let listen = parse_rist_url(&format!("rist://@127.0.0.1:{}", port)).expect("url");
    receiver.peer_create(&listen).expect("peer");
    receiver.start().expect("receiver start");

    let receiver = std::sync::Arc::new(receiver);
    let reader = {
        let receiver = std::sync::Arc::clone(&receiver);
        std::thread::spawn(move || receiver.read(Duration::from_secs(30)))
    };
    std::thread::sleep(Duration::from_millis(100));
    receiver.destroy();

    let result = reader.join().expect("reader thread");
    assert!(matches!(result, Err(Error::Closed)), "reader not woken");
}
