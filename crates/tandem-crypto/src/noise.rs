//! Noise Protocol handshake.
//!
//! Uses Noise XX: `Noise_XX_25519_ChaChaPoly_BLAKE2s`
//!
//! Neither peer knows the other's static key in advance at the Noise
//! level; the key is announced out of band in the session description
//! (`a=tandem-key`) and compared against the key learned here once the
//! handshake completes.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator (offerer)                   Responder (answerer)
//!     |  -> e                                 |
//!     |-------------------------------------->|
//!     |  <- e, ee, s, es                      |
//!     |<--------------------------------------|
//!     |  -> s, se                             |
//!     |-------------------------------------->|
//!     [  handshake hash + remote static key   ]
//! ```

use anyhow::{Context, Result};
use snow::{Builder, HandshakeState};
use thiserror::Error;
use zeroize::Zeroizing;

/// Noise protocol pattern (XX with X25519, ChaCha20-Poly1305, BLAKE2s)
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum message size for Noise handshake
const MAX_HANDSHAKE_MSG_SIZE: usize = 65535;

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("handshake already complete")]
    HandshakeAlreadyComplete,

    #[error("invalid handshake message")]
    InvalidMessage,

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

/// Long-lived X25519 key announced in session descriptions.
///
/// The private half is wiped on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    private: Zeroizing<[u8; 32]>,
    public: [u8; 32],
}

impl StaticKeypair {
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut private = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut private[..]);
        Self::from_private(*private)
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private),
            public: *public.as_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    pub(crate) fn private_key(&self) -> &[u8; 32] {
        &self.private
    }
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Result of a finished handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub handshake_hash: [u8; 32],
    pub remote_static: [u8; 32],
}

/// One side of an XX handshake.
pub struct NoiseHandshake {
    state: Option<Box<HandshakeState>>,
    outcome: Option<HandshakeOutcome>,
    initiator: bool,
}

impl NoiseHandshake {
    pub fn initiator(keypair: &StaticKeypair) -> Result<Self> {
        let state = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(keypair.private_key())
            .build_initiator()
            .context("failed to build noise initiator")?;
        Ok(Self::from_state(state, true))
    }

    pub fn responder(keypair: &StaticKeypair) -> Result<Self> {
        let state = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(keypair.private_key())
            .build_responder()
            .context("failed to build noise responder")?;
        Ok(Self::from_state(state, false))
    }

    fn from_state(state: HandshakeState, initiator: bool) -> Self {
        Self {
            state: Some(Box::new(state)),
            outcome: None,
            initiator,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let state = self
            .state
            .as_mut()
            .ok_or(NoiseError::HandshakeAlreadyComplete)?;
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.write_message(payload, &mut buf)?;
        buf.truncate(len);
        self.finish_if_done()?;
        Ok(buf)
    }

    /// Returns the payload carried by `message`.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let state = self
            .state
            .as_mut()
            .ok_or(NoiseError::HandshakeAlreadyComplete)?;
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.read_message(message, &mut buf)?;
        buf.truncate(len);
        self.finish_if_done()?;
        Ok(buf)
    }

    fn finish_if_done(&mut self) -> Result<(), NoiseError> {
        let done = self
            .state
            .as_ref()
            .map(|s| s.is_handshake_finished())
            .unwrap_or(false);
        if !done {
            return Ok(());
        }
        let state = self.state.take().ok_or(NoiseError::HandshakeNotComplete)?;
        let handshake_hash: [u8; 32] = state
            .get_handshake_hash()
            .try_into()
            .map_err(|_| NoiseError::InvalidMessage)?;
        let remote_static: [u8; 32] = state
            .get_remote_static()
            .ok_or(NoiseError::InvalidMessage)?
            .try_into()
            .map_err(|_| NoiseError::InvalidMessage)?;
        self.outcome = Some(HandshakeOutcome {
            handshake_hash,
            remote_static,
        });
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Result<&HandshakeOutcome, NoiseError> {
        self.outcome.as_ref().ok_or(NoiseError::HandshakeNotComplete)
    }
}
