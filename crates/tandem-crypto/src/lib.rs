//! Cryptography for the tandem transport.
//!
//! This crate provides:
//! - Static X25519 keys announced in session descriptions
//! - Noise XX handshake drivers that tolerate datagram loss
//! - A packet cipher with explicit packet-id nonces
//! - A sliding replay window
//!
//! Datagrams can arrive out of order, so the Noise transport state is not
//! used after the handshake. Instead both sides derive directional
//! ChaCha20-Poly1305 keys from the handshake hash.

#![forbid(unsafe_code)]

pub mod connection;
pub mod noise;
pub mod seq_window;

pub use connection::{ConnectionError, Established, PacketCipher, SecureInitiator, SecureResponder};
pub use noise::{HandshakeOutcome, NoiseError, NoiseHandshake, StaticKeypair};
pub use seq_window::ReplayWindow;
