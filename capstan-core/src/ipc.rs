//! IPC endpoint emulation over loopback TCP.
//!
//! `ipc://` endpoints are not backed by filesystem sockets. The logical
//! path is hashed to a stable loopback port instead, so two processes (or
//! two sockets in one process) naming the same path meet on the same
//! `127.0.0.1` port without any file to create, permission to manage or
//! stale socket file to unlink. The cost is a shared 55536-port band and
//! the theoretical possibility of two paths hashing to the same port.

use std::net::SocketAddr;

/// Seed for the path hash. Fixed so every process derives the same port
/// for the same path.
const HASH_SEED: u32 = 0xc58f_1a7b;

/// Lowest port of the derived band. Ports below stay free for well-known
/// services and explicit `tcp://` use.
const PORT_BASE: u32 = 10_000;

/// Width of the derived band; `PORT_BASE + PORT_RANGE` caps at 65535.
const PORT_RANGE: u32 = 55_536;

/// 32-bit MurmurHash2.
fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Loopback port for an IPC path.
#[must_use]
pub fn derive_port(path: &str) -> u16 {
    let hash = murmur2(path.as_bytes(), HASH_SEED);
    let positive = (hash as i32).unsigned_abs();
    (positive % PORT_RANGE + PORT_BASE) as u16
}

/// Loopback address an `ipc://` endpoint binds or connects to.
#[must_use]
pub fn loopback_addr(path: &str) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], derive_port(path)))
}
