//! Noise handshake over the selected path.
//!
//! The controlling endpoint initiates. Each side repeats its last message
//! after `step_timeout` until the exchange completes or the attempt budget
//! runs out.

use std::time::Duration;

use tandem_crypto::{PacketCipher, SecureInitiator, SecureResponder, StaticKeypair};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, SessionError};

enum Driver {
    Initiator(SecureInitiator),
    Responder(SecureResponder),
}

pub struct Handshake {
    driver: Driver,
    expected_remote: [u8; 32],
    max_attempts: u32,
    step_timeout: Duration,
    attempts: u32,
    last_sent: Option<Instant>,
}

impl Handshake {
    pub fn new(
        initiator: bool,
        keypair: &StaticKeypair,
        expected_remote: [u8; 32],
        max_attempts: u32,
        step_timeout: Duration,
    ) -> Result<Self> {
        let driver = if initiator {
            Driver::Initiator(
                SecureInitiator::new(keypair).map_err(|e| SessionError::Crypto(e.to_string()))?,
            )
        } else {
            Driver::Responder(
                SecureResponder::new(keypair).map_err(|e| SessionError::Crypto(e.to_string()))?,
            )
        };
        Ok(Self {
            driver,
            expected_remote,
            max_attempts: max_attempts.max(1),
            step_timeout,
            attempts: 0,
            last_sent: None,
        })
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self.driver, Driver::Initiator(_))
    }

    /// First message for the initiator, nothing for the responder.
    pub fn start(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        match &mut self.driver {
            Driver::Initiator(init) => {
                let msg1 = init.start()?;
                self.attempts = 1;
                self.last_sent = Some(now);
                Ok(Some(msg1))
            }
            Driver::Responder(_) => Ok(None),
        }
    }

    /// Feed a handshake-channel payload. Returns the reply, if any.
    pub fn handle(&mut self, now: Instant, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let reply = match &mut self.driver {
            Driver::Initiator(init) => init.handle(data)?,
            Driver::Responder(resp) => resp.handle(data)?,
        };
        if reply.is_some() && !self.is_established() {
            if self.last_sent.is_none() {
                self.attempts = 1;
            }
            self.last_sent = Some(now);
        }
        Ok(reply)
    }

    /// Message to repeat when the current step timed out. Fails once the
    /// attempt budget is spent.
    pub fn poll_retransmit(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        if self.is_established() {
            return Ok(None);
        }
        let Some(last) = self.last_sent else {
            return Ok(None);
        };
        if now.saturating_duration_since(last) < self.step_timeout {
            return Ok(None);
        }
        if self.attempts >= self.max_attempts {
            return Err(SessionError::NegotiationFailed(format!(
                "handshake did not complete after {} attempts",
                self.attempts
            )));
        }
        let pending = match &self.driver {
            Driver::Initiator(init) => init.pending_retransmit(),
            Driver::Responder(resp) => resp.pending_retransmit(),
        };
        let Some(pending) = pending.map(<[u8]>::to_vec) else {
            return Ok(None);
        };
        self.attempts += 1;
        self.last_sent = Some(now);
        trace!(attempt = self.attempts, "repeating handshake message");
        Ok(Some(pending))
    }

    pub fn is_established(&self) -> bool {
        match &self.driver {
            Driver::Initiator(init) => init.is_established(),
            Driver::Responder(resp) => resp.is_established(),
        }
    }

    /// Packet cipher once complete, after checking the peer proved the key
    /// it signaled.
    pub fn cipher(&self) -> Option<Result<PacketCipher>> {
        let established = match &self.driver {
            Driver::Initiator(init) => init.established(),
            Driver::Responder(resp) => resp.established(),
        }?;
        if established.remote_static != self.expected_remote {
            return Some(Err(SessionError::NegotiationFailed(
                "peer key does not match its session description".into(),
            )));
        }
        debug!("transport handshake complete");
        Some(Ok(established.cipher.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(expect_a: [u8; 32], expect_b: [u8; 32]) -> (Handshake, Handshake, StaticKeypair, StaticKeypair) {
        let a_key = StaticKeypair::generate();
        let b_key = StaticKeypair::generate();
        let a = Handshake::new(true, &a_key, expect_a, 3, Duration::from_millis(100)).unwrap();
        let b = Handshake::new(false, &b_key, expect_b, 3, Duration::from_millis(100)).unwrap();
        (a, b, a_key, b_key)
    }

    #[test]
    fn completes_and_pins_keys() {
        let a_key = StaticKeypair::generate();
        let b_key = StaticKeypair::generate();
        let mut a = Handshake::new(true, &a_key, *b_key.public_key(), 3, Duration::from_millis(100)).unwrap();
        let mut b = Handshake::new(false, &b_key, *a_key.public_key(), 3, Duration::from_millis(100)).unwrap();
        let now = Instant::now();

        let msg1 = a.start(now).unwrap().unwrap();
        let msg2 = b.handle(now, &msg1).unwrap().unwrap();
        let msg3 = a.handle(now, &msg2).unwrap().unwrap();
        assert!(b.handle(now, &msg3).unwrap().is_none());

        let a_cipher = a.cipher().unwrap().unwrap();
        let b_cipher = b.cipher().unwrap().unwrap();
        let sealed = a_cipher.encrypt(7, b"frame").unwrap();
        assert_eq!(b_cipher.decrypt(7, &sealed).unwrap(), b"frame");
    }

    #[test]
    fn key_mismatch_fails_negotiation() {
        let (mut a, mut b, _, _) = pair([1; 32], [2; 32]);
        let now = Instant::now();
        let msg1 = a.start(now).unwrap().unwrap();
        let msg2 = b.handle(now, &msg1).unwrap().unwrap();
        a.handle(now, &msg2).unwrap();
        assert!(matches!(
            a.cipher(),
            Some(Err(SessionError::NegotiationFailed(_)))
        ));
    }

    #[test]
    fn retransmits_then_gives_up() {
        let (mut a, mut b, _, _) = pair([0; 32], [0; 32]);
        let start = Instant::now();
        a.start(start).unwrap();
        assert!(b.poll_retransmit(start).unwrap().is_none());

        assert!(a.poll_retransmit(start + Duration::from_millis(50)).unwrap().is_none());
        assert!(a.poll_retransmit(start + Duration::from_millis(100)).unwrap().is_some());
        assert!(a.poll_retransmit(start + Duration::from_millis(200)).unwrap().is_some());
        assert!(a.poll_retransmit(start + Duration::from_millis(300)).is_err());
    }
}
