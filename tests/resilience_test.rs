//! Resilience tests: packet loss recovery, out-of-order delivery, concurrent
//! connections, and large transfers over real loopback sockets.

mod common;

use bytes::Bytes;
use common::transfer;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tether::tether_core::{ArqConfig, ArqEngine, DelayConfig};
use tether::{TetherConfig, TetherListener, TetherStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_config(delay: DelayConfig) -> ArqConfig {
    ArqConfig {
        delay,
        ..ArqConfig::default()
    }
}

/// Transfer all output from `src` to `dst`, dropping each datagram
/// independently with probability `loss_rate`.
fn lossy_transfer(src: &mut ArqEngine, dst: &mut ArqEngine, loss_rate: f32) {
    let mut rng = rand::thread_rng();
    for packet in src.drain_output() {
        if rng.gen::<f32>() >= loss_rate {
            let _ = dst.input(packet);
        }
    }
}

/// Transfer all output from `src` to `dst` in random order.
fn reorder_transfer(src: &mut ArqEngine, dst: &mut ArqEngine) {
    let mut packets = src.drain_output();
    packets.shuffle(&mut rand::thread_rng());
    for packet in packets {
        let _ = dst.input(packet);
    }
}

fn do_transfer(src: &mut ArqEngine, dst: &mut ArqEngine, loss_rate: f32, reorder: bool) {
    if reorder {
        let mut packets = src.drain_output();
        packets.shuffle(&mut rand::thread_rng());
        let mut rng = rand::thread_rng();
        for packet in packets {
            if rng.gen::<f32>() >= loss_rate {
                let _ = dst.input(packet);
            }
        }
    } else if loss_rate > 0.0 {
        lossy_transfer(src, dst, loss_rate);
    } else {
        transfer(src, dst);
    }
}

/// Drive both engines through update/flush/transfer rounds, draining every
/// delivered message from `b` so its receive window stays open.
fn run_rounds_draining(
    a: &mut ArqEngine,
    b: &mut ArqEngine,
    rounds: usize,
    loss_rate: f32,
    reorder: bool,
    recv_sink: &mut Vec<Bytes>,
) {
    for _ in 0..rounds {
        let _ = a.update();
        let _ = a.flush();
        do_transfer(a, b, loss_rate, reorder);

        while let Some(msg) = b.recv() {
            recv_sink.push(msg);
        }

        let _ = b.update();
        let _ = b.flush();
        do_transfer(b, a, loss_rate, reorder);
    }
}

// ---------------------------------------------------------------------------
// Packet loss recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn packet_loss_recovery() {
    // Turbo mode disables congestion control, so the send window stays open
    // and retransmission alone carries the test
    let config = engine_config(DelayConfig::turbo());
    let mut a = ArqEngine::new(0xAAAA_0001, config.clone());
    let mut b = ArqEngine::new(0xAAAA_0001, config);

    let messages: Vec<Vec<u8>> = (0..10)
        .map(|i| format!("loss-probe-{i:04}").into_bytes())
        .collect();
    for msg in &messages {
        a.send(Bytes::from(msg.clone())).unwrap();
    }

    // Lose the entire first flight; from here on only retransmission can
    // deliver these messages
    let _ = a.update();
    let _ = a.flush();
    a.drain_output();

    let mut received = Vec::new();
    for _ in 0..60 {
        run_rounds_draining(&mut a, &mut b, 10, 0.3, false, &mut received);
        if received.len() == messages.len() {
            break;
        }
        // Real time must pass for RTO timers to fire
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // Settle over a clean wire so an unlucky loss streak cannot fail the test
    for _ in 0..40 {
        if received.len() == messages.len() {
            break;
        }
        run_rounds_draining(&mut a, &mut b, 5, 0.0, false, &mut received);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(received.len(), messages.len(), "messages lost for good");
    for (i, msg) in received.iter().enumerate() {
        assert_eq!(msg.as_ref(), messages[i].as_slice(), "message {i} corrupted");
    }
    assert!(
        a.stats().retransmits > 0,
        "delivery must have come through retransmission"
    );
}

// ---------------------------------------------------------------------------
// Out-of-order delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn out_of_order_delivery() {
    // Small MTU forces fragmentation: 300 bytes over ~76-byte MSS is 4 packets.
    // Turbo keeps congestion control out of the way so all four are in
    // flight together and the shuffle means something
    let config = ArqConfig {
        mtu: 100,
        delay: DelayConfig::turbo(),
        ..ArqConfig::default()
    };
    let mut a = ArqEngine::new(0xBBBB_0001, config.clone());
    let mut b = ArqEngine::new(0xBBBB_0001, config);

    let message: Vec<u8> = (0u8..=255).cycle().take(300).collect();
    a.send(Bytes::from(message.clone())).unwrap();
    let _ = a.update();
    let _ = a.flush();

    // Deliver the fragments shuffled, then settle with clean rounds
    reorder_transfer(&mut a, &mut b);
    let mut received = Vec::new();
    for _ in 0..10 {
        run_rounds_draining(&mut a, &mut b, 5, 0.0, false, &mut received);
        if !received.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(received.len(), 1, "expected exactly one reassembled message");
    assert_eq!(
        received[0].as_ref(),
        message.as_slice(),
        "reassembly scrambled the payload"
    );
}

// ---------------------------------------------------------------------------
// Combined loss and reorder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loss_and_reorder_combined() {
    let config = ArqConfig {
        mtu: 200,
        delay: DelayConfig::turbo(),
        ..ArqConfig::default()
    };
    let mut a = ArqEngine::new(0xCCCC_0001, config.clone());
    let mut b = ArqEngine::new(0xCCCC_0001, config);

    let messages: Vec<Vec<u8>> = (0..5)
        .map(|i| format!("combo-{i:04}-{}", "x".repeat(80)).into_bytes())
        .collect();
    for msg in &messages {
        a.send(Bytes::from(msg.clone())).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..80 {
        run_rounds_draining(&mut a, &mut b, 10, 0.3, true, &mut received);
        if received.len() == messages.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    for _ in 0..40 {
        if received.len() == messages.len() {
            break;
        }
        run_rounds_draining(&mut a, &mut b, 5, 0.0, false, &mut received);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(
        received.len(),
        messages.len(),
        "messages lost under loss plus reorder"
    );
    for (i, msg) in received.iter().enumerate() {
        assert_eq!(msg.as_ref(), messages[i].as_slice());
    }
}

// ---------------------------------------------------------------------------
// Concurrent connections over one listener
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections() {
    let (addr_tx, addr_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let mut listener =
            TetherListener::bind("127.0.0.1:0".parse().unwrap(), TetherConfig::new().fast_mode())
                .await
                .expect("bind failed");
        addr_tx.send(*listener.local_addr()).expect("addr send failed");

        let mut echoes = Vec::new();
        for _ in 0..5 {
            let (mut stream, _) = timeout(Duration::from_secs(10), listener.accept())
                .await
                .expect("accept timeout")
                .expect("accept failed");
            echoes.push(tokio::spawn(async move {
                let msg = timeout(Duration::from_secs(5), stream.recv())
                    .await
                    .expect("recv timeout")
                    .expect("closed before echo");
                stream.send(&msg).await.expect("echo failed");
                // Hold until the client's goodbye lands
                let _ = timeout(Duration::from_secs(5), stream.recv()).await;
            }));
        }

        // Listener must outlive the echoes: it owns the packet routing
        for echo in echoes {
            echo.await.expect("echo task panicked");
        }
    });

    let addr = addr_rx.await.expect("no server address");

    let mut clients = Vec::new();
    for i in 0..5u32 {
        clients.push(tokio::spawn(async move {
            let mut client = timeout(
                Duration::from_secs(5),
                TetherStream::connect(addr, TetherConfig::new().fast_mode()),
            )
            .await
            .expect("connect timeout")
            .expect("connect failed");

            let msg = format!("client-{i}");
            client.send(msg.as_bytes()).await.expect("send failed");

            let echo = timeout(Duration::from_secs(5), client.recv())
                .await
                .expect("echo timeout")
                .expect("closed before echo");
            client.disconnect().await;
            (msg, echo)
        }));
    }

    for handle in clients {
        let (sent, echoed) = timeout(Duration::from_secs(10), handle)
            .await
            .expect("client timeout")
            .expect("client panicked");
        assert_eq!(sent.as_bytes(), &echoed[..], "echo crossed between clients");
    }

    timeout(Duration::from_secs(10), server)
        .await
        .expect("server timeout")
        .expect("server panicked");
}

// ---------------------------------------------------------------------------
// Large transfer through the full stack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn large_message_over_loopback() {
    let (addr_tx, addr_rx) = oneshot::channel();
    let payload: Vec<u8> = (0..65536).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let mut listener =
            TetherListener::bind("127.0.0.1:0".parse().unwrap(), TetherConfig::file_transfer())
                .await
                .expect("bind failed");
        addr_tx.send(*listener.local_addr()).expect("addr send failed");

        let (mut stream, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept failed");

        let msg = timeout(Duration::from_secs(15), stream.recv())
            .await
            .expect("recv timeout")
            .expect("closed before transfer finished");
        assert_eq!(msg.len(), expected.len(), "large message truncated");
        assert_eq!(&msg[..], &expected[..], "large message corrupted");

        stream.send(b"verified").await.expect("confirmation failed");
        let _ = timeout(Duration::from_secs(5), stream.recv()).await;
    });

    let addr = addr_rx.await.expect("no server address");
    let mut client = timeout(
        Duration::from_secs(5),
        TetherStream::connect(addr, TetherConfig::file_transfer()),
    )
    .await
    .expect("connect timeout")
    .expect("connect failed");

    client.send(&payload).await.expect("send failed");

    let confirmation = timeout(Duration::from_secs(15), client.recv())
        .await
        .expect("confirmation timeout")
        .expect("closed before confirmation");
    assert_eq!(&confirmation[..], b"verified");

    client.disconnect().await;
    timeout(Duration::from_secs(10), server)
        .await
        .expect("server timeout")
        .expect("server panicked");
}
