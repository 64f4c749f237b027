//! Shared helpers for integration tests

use tether::tether_core::ArqEngine;

/// Send all output datagrams from one engine into another engine's input,
/// simulating a perfect wire.
pub fn transfer(src: &mut ArqEngine, dst: &mut ArqEngine) {
    for packet in src.drain_output() {
        let _ = dst.input(packet);
    }
}
