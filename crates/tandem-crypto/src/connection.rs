//! Handshake drivers and the per-packet cipher.
//!
//! The Noise XX exchange runs over unreliable UDP, so both drivers cache
//! their last outgoing message and answer a repeated peer message with
//! it instead of advancing the handshake.
//!
//! Noise transport uses an internal nonce counter that requires in-order
//! decryption. Datagrams can reorder, so after the handshake both sides
//! derive directional keys from the handshake hash and seal packets with
//! ChaCha20-Poly1305 using the packet id as explicit nonce.
//!
//! # Wire Format
//!
//! Handshake channel payloads:
//! ```text
//! [1 byte: type] [noise message]
//! type 0x01 = message 1 (initiator -> responder)
//! type 0x02 = message 2 (responder -> initiator)
//! type 0x03 = message 3 (initiator -> responder)
//! ```

use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::noise::{HandshakeOutcome, NoiseError, NoiseHandshake, StaticKeypair};

/// Handshake message types
pub mod handshake_type {
    pub const MSG1: u8 = 0x01;
    pub const MSG2: u8 = 0x02;
    pub const MSG3: u8 = 0x03;
}

const LABEL_I2R: &[u8] = b"tandem packet key initiator->responder v1";
const LABEL_R2I: &[u8] = b"tandem packet key responder->initiator v1";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid packet format")]
    InvalidPacket,

    #[error("not yet established")]
    NotEstablished,

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),
}

fn frame(kind: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(kind);
    out.extend_from_slice(&body);
    out
}

fn split(data: &[u8]) -> Result<(u8, &[u8]), ConnectionError> {
    match data.split_first() {
        Some((kind, rest)) => Ok((*kind, rest)),
        None => Err(ConnectionError::InvalidPacket),
    }
}

/// Keys and identity produced by a completed handshake.
#[derive(Clone)]
pub struct Established {
    pub cipher: PacketCipher,
    pub remote_static: [u8; 32],
}

impl Established {
    fn from_outcome(outcome: &HandshakeOutcome, is_initiator: bool) -> Self {
        Self {
            cipher: PacketCipher::derive(&outcome.handshake_hash, is_initiator),
            remote_static: outcome.remote_static,
        }
    }
}

/// Initiator-side handshake driver (controlling peer).
pub struct SecureInitiator {
    noise: NoiseHandshake,
    msg1: Option<Vec<u8>>,
    msg3: Option<Vec<u8>>,
    established: Option<Established>,
}

impl SecureInitiator {
    pub fn new(keypair: &StaticKeypair) -> Result<Self> {
        Ok(Self {
            noise: NoiseHandshake::initiator(keypair)?,
            msg1: None,
            msg3: None,
            established: None,
        })
    }

    /// First handshake message. Calling again returns the same bytes for
    /// retransmission.
    pub fn start(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if let Some(msg1) = &self.msg1 {
            return Ok(msg1.clone());
        }
        let msg1 = frame(handshake_type::MSG1, self.noise.write_message(&[])?);
        self.msg1 = Some(msg1.clone());
        Ok(msg1)
    }

    /// Feed a handshake-channel payload from the responder. Returns the
    /// message to send back, if any.
    pub fn handle(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ConnectionError> {
        let (kind, body) = split(data)?;
        if kind != handshake_type::MSG2 {
            return Ok(None);
        }
        // Our message 3 was lost and the responder repeated message 2.
        if let Some(msg3) = &self.msg3 {
            return Ok(Some(msg3.clone()));
        }
        if self.msg1.is_none() {
            return Err(ConnectionError::HandshakeFailed(
                "message 2 before message 1".into(),
            ));
        }

        self.noise.read_message(body)?;
        let msg3 = frame(handshake_type::MSG3, self.noise.write_message(&[])?);
        self.established = Some(Established::from_outcome(self.noise.outcome()?, true));
        self.msg3 = Some(msg3.clone());
        Ok(Some(msg3))
    }

    /// Last message sent, for timer-driven retransmission before completion.
    pub fn pending_retransmit(&self) -> Option<&[u8]> {
        if self.established.is_some() {
            None
        } else {
            self.msg1.as_deref()
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }

    pub fn established(&self) -> Option<&Established> {
        self.established.as_ref()
    }
}

/// Responder-side handshake driver (controlled peer).
pub struct SecureResponder {
    noise: NoiseHandshake,
    msg2: Option<Vec<u8>>,
    established: Option<Established>,
}

impl SecureResponder {
    pub fn new(keypair: &StaticKeypair) -> Result<Self> {
        Ok(Self {
            noise: NoiseHandshake::responder(keypair)?,
            msg2: None,
            established: None,
        })
    }

    /// Feed a handshake-channel payload from the initiator. Returns the
    /// message to send back, if any.
    pub fn handle(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ConnectionError> {
        let (kind, body) = split(data)?;
        match kind {
            handshake_type::MSG1 => {
                if self.established.is_some() {
                    return Ok(None);
                }
                if let Some(msg2) = &self.msg2 {
                    return Ok(Some(msg2.clone()));
                }
                self.noise.read_message(body)?;
                let msg2 = frame(handshake_type::MSG2, self.noise.write_message(&[])?);
                self.msg2 = Some(msg2.clone());
                Ok(Some(msg2))
            }
            handshake_type::MSG3 => {
                if self.established.is_some() {
                    return Ok(None);
                }
                if self.msg2.is_none() {
                    return Err(ConnectionError::HandshakeFailed(
                        "message 3 before message 2".into(),
                    ));
                }
                self.noise.read_message(body)?;
                self.established =
                    Some(Established::from_outcome(self.noise.outcome()?, false));
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Message 2 while waiting for message 3.
    pub fn pending_retransmit(&self) -> Option<&[u8]> {
        if self.established.is_some() {
            None
        } else {
            self.msg2.as_deref()
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }

    pub fn established(&self) -> Option<&Established> {
        self.established.as_ref()
    }
}

/// ChaCha20-Poly1305 with explicit packet-id nonces and directional keys.
#[derive(Clone)]
pub struct PacketCipher {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    /// Directional keys are `SHA-256(label || handshake_hash)`.
    pub fn derive(handshake_hash: &[u8; 32], is_initiator: bool) -> Self {
        let key_i2r = kdf(LABEL_I2R, handshake_hash);
        let key_r2i = kdf(LABEL_R2I, handshake_hash);
        if is_initiator {
            Self::new(&key_i2r, &key_r2i)
        } else {
            Self::new(&key_r2i, &key_i2r)
        }
    }

    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            send_cipher: ChaCha20Poly1305::new(send_key.into()),
            recv_cipher: ChaCha20Poly1305::new(recv_key.into()),
        }
    }

    pub fn encrypt(&self, packet_id: u64, plaintext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.send_cipher
            .encrypt(&packet_id_to_nonce(packet_id), plaintext)
            .map_err(|_| ConnectionError::EncryptionFailed)
    }

    pub fn decrypt(&self, packet_id: u64, ciphertext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.recv_cipher
            .decrypt(&packet_id_to_nonce(packet_id), ciphertext)
            .map_err(|_| ConnectionError::DecryptionFailed)
    }
}

fn kdf(label: &[u8], handshake_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(handshake_hash);
    hasher.finalize().into()
}

fn packet_id_to_nonce(packet_id: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&packet_id.to_le_bytes());
    Nonce::from(nonce_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecureInitiator, SecureResponder, StaticKeypair, StaticKeypair) {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        (
            SecureInitiator::new(&a).unwrap(),
            SecureResponder::new(&b).unwrap(),
            a,
            b,
        )
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (mut initiator, mut responder, a, b) = pair();

        let msg1 = initiator.start().unwrap();
        let msg2 = responder.handle(&msg1).unwrap().unwrap();
        let msg3 = initiator.handle(&msg2).unwrap().unwrap();
        assert!(responder.handle(&msg3).unwrap().is_none());

        assert!(initiator.is_established());
        assert!(responder.is_established());
        assert_eq!(&initiator.established().unwrap().remote_static, b.public_key());
        assert_eq!(&responder.established().unwrap().remote_static, a.public_key());
    }

    #[test]
    fn duplicated_messages_are_answered_from_cache() {
        let (mut initiator, mut responder, _, _) = pair();

        let msg1 = initiator.start().unwrap();
        assert_eq!(initiator.start().unwrap(), msg1);
        let msg2 = responder.handle(&msg1).unwrap().unwrap();
        assert_eq!(responder.handle(&msg1).unwrap().unwrap(), msg2);

        let msg3 = initiator.handle(&msg2).unwrap().unwrap();
        // message 3 lost, responder repeats message 2
        assert_eq!(initiator.handle(&msg2).unwrap().unwrap(), msg3);
        responder.handle(&msg3).unwrap();
        assert!(responder.handle(&msg3).unwrap().is_none());
        assert!(responder.pending_retransmit().is_none());
    }

    #[test]
    fn packets_decrypt_across_directions() {
        let (mut initiator, mut responder, _, _) = pair();
        let msg1 = initiator.start().unwrap();
        let msg2 = responder.handle(&msg1).unwrap().unwrap();
        let msg3 = initiator.handle(&msg2).unwrap().unwrap();
        responder.handle(&msg3).unwrap();

        let i = initiator.established().unwrap().cipher.clone();
        let r = responder.established().unwrap().cipher.clone();

        let ct = i.encrypt(7, b"to responder").unwrap();
        assert_eq!(r.decrypt(7, &ct).unwrap(), b"to responder");
        assert!(r.decrypt(8, &ct).is_err());
        // Own direction key must not open own packets.
        assert!(i.decrypt(7, &ct).is_err());

        let ct = r.encrypt(1, b"to initiator").unwrap();
        assert_eq!(i.decrypt(1, &ct).unwrap(), b"to initiator");
    }

    #[test]
    fn garbage_is_rejected() {
        let (mut initiator, mut responder, _, _) = pair();
        assert!(matches!(
            responder.handle(&[]),
            Err(ConnectionError::InvalidPacket)
        ));
        assert!(responder.handle(&[handshake_type::MSG1, 1, 2, 3]).is_err());
        assert!(initiator.handle(&[handshake_type::MSG2, 0]).is_err());
        assert!(responder
            .handle(&[handshake_type::MSG3, 9, 9])
            .is_err());
    }
}
