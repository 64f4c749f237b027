//! Core-only integration tests with no tokio dependency. Two engines wired
//! back-to-back through an in-memory pipe that can drop, duplicate, and
//! reorder datagrams.

use bytes::{BufMut, Bytes, BytesMut};
use std::thread::sleep;
use std::time::Duration;
use tether_core::{ArqConfig, ArqEngine, DelayConfig};

/// Move all pending output from one engine into the other's input.
fn transfer(src: &mut ArqEngine, dst: &mut ArqEngine) {
    for pkt in src.drain_output() {
        let _ = dst.input(pkt);
    }
}

/// One round: update both engines and exchange everything, loss-free.
fn exchange(a: &mut ArqEngine, b: &mut ArqEngine) {
    let _ = a.update();
    transfer(a, b);
    let _ = b.update();
    transfer(b, a);
}

/// Payload carrying its index in the first four bytes, padded to `len`.
fn tagged(i: u32, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len.max(4));
    buf.put_u32_le(i);
    buf.resize(len.max(4), (i % 251) as u8);
    buf.freeze()
}

fn tag_of(msg: &[u8]) -> u32 {
    u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]])
}

#[test]
fn basic_send_recv() {
    let config = ArqConfig::default();
    let mut client = ArqEngine::new(1, config.clone());
    let mut server = ArqEngine::new(1, config);

    client.send(Bytes::from_static(b"hello")).unwrap();
    exchange(&mut client, &mut server);

    assert_eq!(server.recv().as_deref(), Some(&b"hello"[..]));
    assert_eq!(server.recv(), None);
}

#[test]
fn fragment_boundaries_survive_reassembly() {
    let config = ArqConfig::default();
    let mut client = ArqEngine::new(2, config.clone());
    let mut server = ArqEngine::new(2, config.clone());

    // Three full MTUs plus a ragged tail
    let payload = tagged(7, 3 * config.mtu as usize + 17);
    client.send(payload.clone()).unwrap();

    for _ in 0..8 {
        exchange(&mut client, &mut server);
        sleep(Duration::from_millis(10));
    }

    let got = server.recv().expect("reassembled message");
    assert_eq!(got, payload);
    assert_eq!(server.recv(), None, "one send is one message");
}

#[test]
fn large_message_in_many_fragments() {
    let config = ArqConfig::default();
    let mut client = ArqEngine::new(3, config.clone());
    let mut server = ArqEngine::new(3, config);

    let payload = tagged(9, 64 * 1024);
    client.send(payload.clone()).unwrap();

    let mut got = None;
    for _ in 0..300 {
        exchange(&mut client, &mut server);
        if let Some(msg) = server.recv() {
            got = Some(msg);
            break;
        }
        sleep(Duration::from_millis(5));
    }

    let got = got.expect("64 KiB message arrives");
    assert_eq!(got.len(), payload.len());
    assert_eq!(got, payload);
}

#[test]
fn in_order_delivery_through_hostile_pipe() {
    // Each batch is reversed, every 7th datagram dropped, every 5th doubled
    let config = ArqConfig {
        delay: DelayConfig::fast(),
        ..ArqConfig::default()
    };
    let mut client = ArqEngine::new(4, config.clone());
    let mut server = ArqEngine::new(4, config);

    let total = 40u32;
    for i in 0..total {
        client.send(tagged(i, 600)).unwrap();
    }

    let mut wire = 0u32;
    let mut got = Vec::new();
    for _round in 0..600 {
        let _ = client.update();
        let mut batch = client.drain_output();
        batch.reverse();
        for pkt in batch {
            wire += 1;
            if wire % 7 == 0 {
                continue;
            }
            if wire % 5 == 0 {
                let _ = server.input(pkt.clone());
            }
            let _ = server.input(pkt);
        }
        let _ = server.update();
        transfer(&mut server, &mut client);
        while let Some(msg) = server.recv() {
            got.push(msg);
        }
        if got.len() as u32 == total {
            break;
        }
        sleep(Duration::from_millis(4));
    }

    assert_eq!(got.len() as u32, total);
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(tag_of(msg), i as u32, "messages arrive in send order");
    }
    assert!(server.stats().duplicates_dropped > 0);
    assert!(client.stats().retransmits + client.stats().fast_retransmits > 0);
}

#[test]
fn bulk_transfer_with_periodic_loss_recovers() {
    // 100 x 1 KiB through a pipe dropping every 7th datagram
    let config = ArqConfig {
        mtu: 512,
        snd_wnd: 32,
        rcv_wnd: 128,
        delay: DelayConfig::fast(),
        ..ArqConfig::default()
    };
    let mut client = ArqEngine::new(5, config.clone());
    let mut server = ArqEngine::new(5, config);

    let total = 100u32;
    let mut next_send = 0u32;
    let mut wire = 0u32;
    let mut got = Vec::new();

    for _round in 0..2000 {
        while next_send < total {
            match client.send(tagged(next_send, 1024)) {
                Ok(()) => next_send += 1,
                Err(e) => {
                    assert!(e.is_backpressure(), "only backpressure expected: {e}");
                    break;
                }
            }
        }
        let _ = client.update();
        for pkt in client.drain_output() {
            wire += 1;
            if wire % 7 == 0 {
                continue;
            }
            let _ = server.input(pkt);
        }
        let _ = server.update();
        transfer(&mut server, &mut client);
        while let Some(msg) = server.recv() {
            got.push(msg);
        }
        if got.len() as u32 == total {
            break;
        }
        sleep(Duration::from_millis(4));
    }

    assert_eq!(got.len() as u32, total, "every message is delivered");
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(msg.len(), 1024);
        assert_eq!(tag_of(msg), i as u32);
    }
    let stats = client.stats();
    assert!(
        stats.retransmits + stats.fast_retransmits > 0,
        "loss forced retransmission"
    );
    assert!(
        stats.congestion_events >= 1,
        "loss shrank the congestion window"
    );
}

#[test]
fn send_backlog_backpressure_clears() {
    let config = ArqConfig::default();
    let mut client = ArqEngine::new(6, config.clone());
    let mut server = ArqEngine::new(6, config);

    let mut accepted = 0u32;
    loop {
        match client.send(tagged(accepted, 32)) {
            Ok(()) => accepted += 1,
            Err(e) => {
                assert!(e.is_backpressure());
                break;
            }
        }
        assert!(accepted < 10_000, "backlog must be bounded");
    }
    assert!(accepted >= 32, "at least a window's worth fits");

    let mut got = 0u32;
    for _ in 0..400 {
        exchange(&mut client, &mut server);
        while server.recv().is_some() {
            got += 1;
        }
        if got == accepted {
            break;
        }
        sleep(Duration::from_millis(4));
    }
    assert_eq!(got, accepted, "every accepted message still arrives");

    // Backlog drained, writes flow again
    client.send(tagged(accepted, 32)).unwrap();
}

#[test]
fn stats_reflect_traffic() {
    let config = ArqConfig::default();
    let mut client = ArqEngine::new(7, config.clone());
    let mut server = ArqEngine::new(7, config);

    client.send(tagged(1, 256)).unwrap();
    for _ in 0..4 {
        exchange(&mut client, &mut server);
        sleep(Duration::from_millis(5));
    }
    let _ = server.recv();

    let cs = client.stats();
    assert_eq!(cs.messages_sent, 1);
    assert!(cs.segments_sent > 0);
    assert!(cs.bytes_sent > 0);
    assert!(cs.srtt > 0, "acked round trip produced an RTT sample");

    let ss = server.stats();
    assert_eq!(ss.messages_received, 1);
    assert!(ss.segments_received > 0);
    assert!(ss.bytes_received > 0);
}

#[test]
fn conv_mismatch_is_ignored() {
    let mut client = ArqEngine::new(100, ArqConfig::default());
    let mut server = ArqEngine::new(999, ArqConfig::default());

    client.send(Bytes::from_static(b"mismatch")).unwrap();
    exchange(&mut client, &mut server);

    assert_eq!(server.recv(), None);
    assert_eq!(server.stats().messages_received, 0);
}

#[test]
fn zero_window_stall_recovers_after_drain() {
    let client_cfg = ArqConfig {
        probe_init_ms: 40,
        ..ArqConfig::default()
    };
    let server_cfg = ArqConfig {
        rcv_wnd: 8,
        ..ArqConfig::default()
    };
    let mut client = ArqEngine::new(8, client_cfg);
    let mut server = ArqEngine::new(8, server_cfg);

    let total = 20u32;
    for i in 0..total {
        client.send(tagged(i, 64)).unwrap();
    }

    // Server never drains; its advertised window slams shut
    for _ in 0..12 {
        exchange(&mut client, &mut server);
        sleep(Duration::from_millis(10));
    }
    assert_eq!(client.remote_window(), 0, "peer advertised a closed window");
    assert!(client.pending_send() > 0, "writer still has queued traffic");

    // Stall long enough for a probe
    for _ in 0..8 {
        exchange(&mut client, &mut server);
        sleep(Duration::from_millis(10));
    }
    assert!(client.stats().probes_sent >= 1, "zero window provoked a probe");

    // Consumer wakes up; the window reopens and the rest flows
    let mut got = Vec::new();
    for _ in 0..100 {
        while let Some(msg) = server.recv() {
            got.push(msg);
        }
        exchange(&mut client, &mut server);
        if got.len() as u32 == total {
            break;
        }
        sleep(Duration::from_millis(8));
    }
    assert_eq!(got.len() as u32, total);
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(tag_of(msg), i as u32);
    }
}
