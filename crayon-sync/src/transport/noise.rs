//! Noise session encryption for peer links.
//!
//! Every link runs `Noise_NN_25519_ChaChaPoly_BLAKE2s`: a two-message
//! ephemeral Diffie-Hellman handshake followed by ChaCha20-Poly1305 transport
//! messages. NN gives confidentiality and integrity but no peer
//! authentication; links accept any peer that completes the handshake.

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};

const NOISE_PARAMS: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message on the wire.
pub const MAX_NOISE_MESSAGE: usize = 65_535;
const TAG_LEN: usize = 16;
/// Largest plaintext that fits in one transport message.
pub const MAX_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseError {
    Setup(String),
    Handshake(String),
    Crypto(String),
    TooLarge(usize),
}

impl std::fmt::Display for NoiseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "Noise setup failed: {e}"),
            Self::Handshake(e) => write!(f, "Noise handshake failed: {e}"),
            Self::Crypto(e) => write!(f, "Noise transport error: {e}"),
            Self::TooLarge(n) => write!(f, "Plaintext of {n} bytes exceeds {MAX_PLAINTEXT}"),
        }
    }
}

impl std::error::Error for NoiseError {}

fn builder() -> Result<Builder<'static>, NoiseError> {
    let params: NoiseParams = NOISE_PARAMS
        .parse()
        .map_err(|e: snow::Error| NoiseError::Setup(e.to_string()))?;
    Ok(Builder::new(params))
}

/// Handshake in progress.
pub struct NoiseHandshake {
    state: HandshakeState,
}

impl NoiseHandshake {
    pub fn initiator() -> Result<Self, NoiseError> {
        let state = builder()?
            .build_initiator()
            .map_err(|e| NoiseError::Setup(e.to_string()))?;
        Ok(Self { state })
    }

    pub fn responder() -> Result<Self, NoiseError> {
        let state = builder()?
            .build_responder()
            .map_err(|e| NoiseError::Setup(e.to_string()))?;
        Ok(Self { state })
    }

    /// Produce the next handshake message (no early payload).
    pub fn write_message(&mut self) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| NoiseError::Handshake(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the peer's handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        self.state
            .read_message(message, &mut buf)
            .map_err(|e| NoiseError::Handshake(e.to_string()))?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    pub fn into_session(self) -> Result<NoiseSession, NoiseError> {
        let state = self
            .state
            .into_transport_mode()
            .map_err(|e| NoiseError::Handshake(e.to_string()))?;
        Ok(NoiseSession { state })
    }
}

/// Established session: encrypts outbound and decrypts inbound messages.
pub struct NoiseSession {
    state: TransportState,
}

impl NoiseSession {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(NoiseError::TooLarge(plaintext.len()));
        }
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .state
            .write_message(plaintext, &mut buf)
            .map_err(|e| NoiseError::Crypto(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if ciphertext.len() > MAX_NOISE_MESSAGE {
            return Err(NoiseError::TooLarge(ciphertext.len()));
        }
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut buf)
            .map_err(|e| NoiseError::Crypto(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (NoiseSession, NoiseSession) {
        let mut initiator = NoiseHandshake::initiator().unwrap();
        let mut responder = NoiseHandshake::responder().unwrap();

        let m1 = initiator.write_message().unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message().unwrap();
        initiator.read_message(&m2).unwrap();

        assert!(initiator.is_finished());
        assert!(responder.is_finished());
        (initiator.into_session().unwrap(), responder.into_session().unwrap())
    }

    #[test]
    fn test_handshake_and_both_directions() {
        let (mut alice, mut bob) = handshake();

        let sealed = alice.seal(b"update_ping").unwrap();
        assert_ne!(&sealed[..], b"update_ping");
        assert_eq!(bob.open(&sealed).unwrap(), b"update_ping");

        let reply = bob.seal(b"sync_ping").unwrap();
        assert_eq!(alice.open(&reply).unwrap(), b"sync_ping");
    }

    #[test]
    fn test_ordered_messages() {
        let (mut alice, mut bob) = handshake();
        let sealed: Vec<_> = (0..5u8).map(|i| alice.seal(&[i]).unwrap()).collect();
        for (i, msg) in sealed.iter().enumerate() {
            assert_eq!(bob.open(msg).unwrap(), vec![i as u8]);
        }
    }

    #[test]
    fn test_tampered_message_rejected() {
        let (mut alice, mut bob) = handshake();
        let mut sealed = alice.seal(b"pose").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(bob.open(&sealed), Err(NoiseError::Crypto(_))));
    }

    #[test]
    fn test_foreign_session_rejected() {
        let (mut alice, _bob) = handshake();
        let (_carol, mut dave) = handshake();
        let sealed = alice.seal(b"pose").unwrap();
        assert!(dave.open(&sealed).is_err());
    }

    #[test]
    fn test_oversized_plaintext() {
        let (mut alice, _bob) = handshake();
        let big = vec![0u8; MAX_PLAINTEXT + 1];
        assert_eq!(alice.seal(&big), Err(NoiseError::TooLarge(MAX_PLAINTEXT + 1)));
        assert!(alice.seal(&vec![0u8; MAX_PLAINTEXT]).is_ok());
    }

    #[test]
    fn test_garbage_handshake_rejected() {
        let mut responder = NoiseHandshake::responder().unwrap();
        assert!(responder.read_message(&[1, 2, 3]).is_err());
    }
}
