//! Thin wrapper over `snow` for the XX handshake and stateless transport.
//!
//! Transport ciphertexts carry their nonce explicitly:
//!
//! ```text
//! +-------------+---------------------------+
//! | nonce u64be | ciphertext + 16 byte tag  |
//! +-------------+---------------------------+
//! ```
//!
//! so packets may be lost or reordered in the mesh without desynchronizing
//! the two sides.

use crate::replay::ReplayWindow;
use crate::SessionError;
use bytes::{BufMut, Bytes, BytesMut};
use snow::params::NoiseParams;

/// Noise protocol name
pub const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest Noise message
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// AEAD tag length
pub const TAG_SIZE: usize = 16;

/// Explicit nonce prefix length
pub const NONCE_SIZE: usize = 8;

fn params() -> Result<NoiseParams, SessionError> {
    NOISE_PARAMS
        .parse()
        .map_err(|e: snow::Error| SessionError::Handshake(e.to_string()))
}

/// In-progress XX handshake
pub(crate) struct Handshake {
    state: Box<snow::HandshakeState>,
}

impl Handshake {
    pub(crate) fn initiator(private_key: &[u8]) -> Result<Self, SessionError> {
        let state = snow::Builder::new(params()?)
            .local_private_key(private_key)
            .build_initiator()?;
        Ok(Self {
            state: Box::new(state),
        })
    }

    pub(crate) fn responder(private_key: &[u8]) -> Result<Self, SessionError> {
        let state = snow::Builder::new(params()?)
            .local_private_key(private_key)
            .build_responder()?;
        Ok(Self {
            state: Box::new(state),
        })
    }

    /// Produce the next handshake message (empty payload)
    pub(crate) fn write(&mut self) -> Result<Bytes, SessionError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Consume the peer's handshake message
    pub(crate) fn read(&mut self, message: &[u8]) -> Result<(), SessionError> {
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];
        self.state.read_message(message, &mut payload)?;
        Ok(())
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    pub(crate) fn remote_static(&self) -> Option<Vec<u8>> {
        self.state.get_remote_static().map(<[u8]>::to_vec)
    }

    pub(crate) fn into_transport(self) -> Result<Transport, SessionError> {
        let cipher = (*self.state).into_stateless_transport_mode()?;
        Ok(Transport {
            cipher,
            send_nonce: 0,
            replay: ReplayWindow::new(),
        })
    }
}

/// Established transport keys
pub(crate) struct Transport {
    cipher: snow::StatelessTransportState,
    send_nonce: u64,
    replay: ReplayWindow,
}

impl Transport {
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        if plaintext.len() + TAG_SIZE > MAX_NOISE_MESSAGE {
            return Err(SessionError::TooLarge(plaintext.len()));
        }
        let nonce = self.send_nonce;
        self.send_nonce = nonce.checked_add(1).ok_or(SessionError::Exhausted)?;

        let mut ciphertext = vec![0u8; plaintext.len() + TAG_SIZE];
        let len = self
            .cipher
            .write_message(nonce, plaintext, &mut ciphertext)
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        let mut out = BytesMut::with_capacity(NONCE_SIZE + len);
        out.put_u64(nonce);
        out.put_slice(&ciphertext[..len]);
        Ok(out.freeze())
    }

    pub(crate) fn decrypt(&mut self, frame: &[u8]) -> Result<Bytes, SessionError> {
        if frame.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SessionError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_SIZE);
        let mut raw = [0u8; NONCE_SIZE];
        raw.copy_from_slice(nonce_bytes);
        let nonce = u64::from_be_bytes(raw);

        if !self.replay.check(nonce) {
            return Err(SessionError::Replay(nonce));
        }

        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = self
            .cipher
            .read_message(nonce, ciphertext, &mut plaintext)
            .map_err(|_| SessionError::Decrypt)?;
        self.replay.accept(nonce);

        plaintext.truncate(len);
        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_identity::NodeIdentity;

    fn established() -> (Transport, Transport) {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let mut init = Handshake::initiator(&a.private_key()).unwrap();
        let mut resp = Handshake::responder(&b.private_key()).unwrap();

        let m1 = init.write().unwrap();
        resp.read(&m1).unwrap();
        let m2 = resp.write().unwrap();
        init.read(&m2).unwrap();
        let m3 = init.write().unwrap();
        resp.read(&m3).unwrap();

        assert!(init.is_finished() && resp.is_finished());
        assert_eq!(init.remote_static().unwrap(), b.public_key().to_vec());
        assert_eq!(resp.remote_static().unwrap(), a.public_key().to_vec());

        (init.into_transport().unwrap(), resp.into_transport().unwrap())
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut a, mut b) = established();
        let first = a.encrypt(b"one").unwrap();
        let second = a.encrypt(b"two").unwrap();

        assert_eq!(&b.decrypt(&second).unwrap()[..], b"two");
        assert_eq!(&b.decrypt(&first).unwrap()[..], b"one");
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut a, mut b) = established();
        let frame = a.encrypt(b"hello").unwrap();
        b.decrypt(&frame).unwrap();
        assert_eq!(b.decrypt(&frame), Err(SessionError::Replay(0)));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let (mut a, mut b) = established();
        let mut frame = a.encrypt(b"hello").unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(b.decrypt(&frame), Err(SessionError::Decrypt));
        assert_eq!(b.decrypt(&frame[..4]), Err(SessionError::Decrypt));
    }

    #[test]
    fn test_both_directions() {
        let (mut a, mut b) = established();
        let reply = b.encrypt(b"pong").unwrap();
        assert_eq!(&a.decrypt(&reply).unwrap()[..], b"pong");
    }
}
