//! The per-peer session state machine.
//!
//! Lifecycle: `NoSession → HandshakeSent → Established → Closed`. Both
//! sides generate one ephemeral key pair per session; a simultaneous open
//! converges because the session key is derived from the same ephemeral
//! pair on both sides regardless of who initiated.

use std::time::{Duration, Instant};

use murk_core::{
    derive_packet_key, derive_session_key, open_xchacha20poly1305, seal_xchacha20poly1305,
    AeadError, KeyPair, NodeId, NONCE_SIZE,
};
use murk_proto::{Packet, PacketTag};
use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::{ReplayWindow, DEFAULT_SESSION_TIMEOUT_SECS, REPLAY_WINDOW};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation requires an established session
    #[error("Session not established (state: {0:?})")]
    NotEstablished(SessionState),

    /// Counter already accepted or fallen out of the replay window
    #[error("Replayed or expired counter: {0}")]
    Replayed(u64),

    /// AEAD failure (tamper, wrong key)
    #[error("Crypto failure: {0}")]
    Crypto(#[from] AeadError),

    /// Packet is not the kind this operation consumes
    #[error("Unexpected packet kind")]
    UnexpectedPacket,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake exchanged
    NoSession,
    /// Our handshake is out, waiting for the peer's
    HandshakeSent,
    /// Session key derived, traffic flows
    Established,
    /// Expired or torn down; key material wiped
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which an established session expires
    pub timeout: Duration,
    /// Replay window width in packets
    pub replay_window: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            replay_window: REPLAY_WINDOW,
        }
    }
}

/// An encrypted session with one peer.
pub struct Session {
    local: KeyPair,
    peer: NodeId,
    state: SessionState,
    config: SessionConfig,
    /// Our ephemeral pair for this session
    ephemeral: Option<KeyPair>,
    /// Our handshake base nonce; prefixes our data-packet nonces
    base_nonce: [u8; NONCE_SIZE],
    /// Peer's handshake base nonce; prefixes their data-packet nonces
    peer_base_nonce: Option<[u8; NONCE_SIZE]>,
    /// Peer's ephemeral public key, once their handshake authenticated
    peer_ephemeral: Option<NodeId>,
    key: Option<[u8; 32]>,
    send_counter: u64,
    replay: ReplayWindow,
    last_accepted: Instant,
}

impl Session {
    /// Creates a fresh session toward a peer. No packets are exchanged yet.
    pub fn new(local: KeyPair, peer: NodeId, config: SessionConfig) -> Self {
        let replay = ReplayWindow::new(config.replay_window);
        Self {
            local,
            peer,
            state: SessionState::NoSession,
            config,
            ephemeral: None,
            base_nonce: random_nonce(),
            peer_base_nonce: None,
            peer_ephemeral: None,
            key: None,
            send_counter: 0,
            replay,
            last_accepted: Instant::now(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true once the session key is derived.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Returns the peer identity.
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Emits our handshake packet and moves to `HandshakeSent`.
    ///
    /// Calling again while still waiting re-emits the same packet, so the
    /// caller can retry on a timer without minting fresh ephemerals.
    pub fn initiate(&mut self) -> Result<Packet, SessionError> {
        match self.state {
            SessionState::NoSession | SessionState::HandshakeSent => {}
            state => return Err(SessionError::NotEstablished(state)),
        }

        let ephemeral_public = self
            .ephemeral
            .get_or_insert_with(KeyPair::generate)
            .public;
        self.state = SessionState::HandshakeSent;
        Ok(self.handshake_packet(ephemeral_public))
    }

    /// Consumes a handshake packet.
    ///
    /// Returns a reply handshake when we were the passive side. Handshakes
    /// that fail to authenticate are discarded without effect; the caller
    /// should not respond to them.
    pub fn handle_handshake(&mut self, packet: &Packet) -> Option<Packet> {
        let (sender, nonce, sealed_ephemeral) = match packet {
            Packet::Handshake {
                sender,
                nonce,
                sealed_ephemeral,
            } => (sender, nonce, sealed_ephemeral),
            _ => return None,
        };
        if *sender != self.peer {
            return None;
        }

        let packet_key = derive_packet_key(&self.local.secret, &self.peer);
        let opened =
            match open_xchacha20poly1305(&packet_key, nonce, sealed_ephemeral, sender.as_bytes()) {
                Ok(bytes) if bytes.len() == 32 => bytes,
                _ => {
                    trace!(peer = %self.peer, "Dropping handshake that failed to authenticate");
                    return None;
                }
            };
        let mut ephemeral_bytes = [0u8; 32];
        ephemeral_bytes.copy_from_slice(&opened);
        let peer_ephemeral = NodeId::new(ephemeral_bytes);

        match self.state {
            SessionState::Established => {
                // Retransmitted handshake for the live session: our reply
                // never arrived, so answer it again. The re-seal is
                // deterministic, the peer sees the identical packet.
                if self.peer_ephemeral == Some(peer_ephemeral) {
                    return self
                        .ephemeral
                        .as_ref()
                        .map(|pair| pair.public)
                        .map(|public| self.handshake_packet(public));
                }
                debug!(peer = %self.peer, "New ephemeral on an established session, ignoring");
                None
            }
            SessionState::HandshakeSent => {
                self.peer_base_nonce = Some(*nonce);
                self.peer_ephemeral = Some(peer_ephemeral);
                self.establish(peer_ephemeral);
                None
            }
            SessionState::NoSession | SessionState::Closed => {
                // Passive side, or starting over after expiry.
                self.reset_for_new_handshake();
                let own_ephemeral = KeyPair::generate();
                let own_public = own_ephemeral.public;
                self.ephemeral = Some(own_ephemeral);
                self.peer_base_nonce = Some(*nonce);
                self.peer_ephemeral = Some(peer_ephemeral);
                self.establish(peer_ephemeral);
                Some(self.handshake_packet(own_public))
            }
        }
    }

    /// Seals plaintext into a data packet, consuming one counter value.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Packet, SessionError> {
        let key = match (&self.state, &self.key) {
            (SessionState::Established, Some(key)) => key,
            _ => return Err(SessionError::NotEstablished(self.state)),
        };

        let counter = self.send_counter;
        let nonce = data_nonce(&self.base_nonce, counter);
        let aad = [PacketTag::Data as u8];
        let ciphertext = seal_xchacha20poly1305(key, &nonce, plaintext, &aad)?;
        self.send_counter += 1;

        Ok(Packet::Data { counter, ciphertext })
    }

    /// Opens a data packet: authenticates, then replay-checks the counter.
    ///
    /// The replay window only learns counters whose packets authenticated,
    /// so garbage cannot poison it.
    pub fn decrypt(&mut self, packet: &Packet) -> Result<Vec<u8>, SessionError> {
        let (counter, ciphertext) = match packet {
            Packet::Data { counter, ciphertext } => (*counter, ciphertext),
            _ => return Err(SessionError::UnexpectedPacket),
        };
        let (key, peer_base) = match (&self.state, &self.key, &self.peer_base_nonce) {
            (SessionState::Established, Some(key), Some(base)) => (key, base),
            _ => return Err(SessionError::NotEstablished(self.state)),
        };

        let nonce = data_nonce(peer_base, counter);
        let aad = [PacketTag::Data as u8];
        let plaintext = open_xchacha20poly1305(key, &nonce, ciphertext, &aad)?;

        if !self.replay.check_and_update(counter) {
            return Err(SessionError::Replayed(counter));
        }

        self.last_accepted = Instant::now();
        Ok(plaintext)
    }

    /// Expires the session if no traffic was accepted within the timeout.
    ///
    /// Returns true if this call closed the session. A no-op on sessions
    /// that are not established.
    pub fn check_timeout(&mut self) -> bool {
        if self.state != SessionState::Established {
            return false;
        }
        if self.last_accepted.elapsed() <= self.config.timeout {
            return false;
        }
        debug!(peer = %self.peer, "Session expired");
        self.close();
        true
    }

    /// Tears the session down and wipes the key material. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
        }
        self.ephemeral = None;
        self.peer_ephemeral = None;
        self.peer_base_nonce = None;
        self.state = SessionState::Closed;
    }

    fn establish(&mut self, peer_ephemeral: NodeId) {
        // Invariant: self.ephemeral is set on every path that reaches here.
        let ephemeral = match &self.ephemeral {
            Some(pair) => pair,
            None => return,
        };
        let key = derive_session_key(&ephemeral.secret, &peer_ephemeral, &ephemeral.public);
        self.key = Some(key);
        self.state = SessionState::Established;
        self.last_accepted = Instant::now();
        debug!(peer = %self.peer, "Session established");
    }

    fn reset_for_new_handshake(&mut self) {
        self.close();
        self.base_nonce = random_nonce();
        self.send_counter = 0;
        self.replay = ReplayWindow::new(self.config.replay_window);
        self.state = SessionState::NoSession;
    }

    fn handshake_packet(&self, ephemeral_public: NodeId) -> Packet {
        let packet_key = derive_packet_key(&self.local.secret, &self.peer);
        let sealed_ephemeral = seal_xchacha20poly1305(
            &packet_key,
            &self.base_nonce,
            ephemeral_public.as_bytes(),
            self.local.public.as_bytes(),
        )
        .unwrap_or_default();

        Packet::Handshake {
            sender: self.local.public,
            nonce: self.base_nonce,
            sealed_ephemeral,
        }
    }
}

fn data_nonce(base: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..16].copy_from_slice(&base[..16]);
    nonce[16..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let sa = Session::new(a.clone(), b.public, SessionConfig::default());
        let sb = Session::new(b, a.public, SessionConfig::default());
        (sa, sb)
    }

    fn establish(a: &mut Session, b: &mut Session) {
        let hs = a.initiate().unwrap();
        let reply = b.handle_handshake(&hs).expect("passive side replies");
        assert!(a.handle_handshake(&reply).is_none());
        assert!(a.is_established());
        assert!(b.is_established());
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);
    }

    #[test]
    fn test_simultaneous_open_converges() {
        let (mut a, mut b) = pair();

        let hs_a = a.initiate().unwrap();
        let hs_b = b.initiate().unwrap();

        // Both in HandshakeSent; crossing handshakes establish without
        // further replies.
        assert!(a.handle_handshake(&hs_b).is_none());
        assert!(b.handle_handshake(&hs_a).is_none());
        assert!(a.is_established());
        assert!(b.is_established());

        // The derived keys agree: traffic flows both ways.
        let msg = a.encrypt(b"crossed").unwrap();
        assert_eq!(b.decrypt(&msg).unwrap(), b"crossed");
        let msg = b.encrypt(b"back").unwrap();
        assert_eq!(a.decrypt(&msg).unwrap(), b"back");
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        for i in 0..10u8 {
            let plaintext = vec![i; 100];
            let packet = a.encrypt(&plaintext).unwrap();
            assert_eq!(b.decrypt(&packet).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        let packet = a.encrypt(b"payload").unwrap();
        let tampered = match packet {
            Packet::Data { counter, mut ciphertext } => {
                ciphertext[0] ^= 0x01;
                Packet::Data { counter, ciphertext }
            }
            other => panic!("unexpected packet: {other:?}"),
        };
        assert!(matches!(b.decrypt(&tampered), Err(SessionError::Crypto(_))));
    }

    #[test]
    fn test_replay_rejected() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        let packet = a.encrypt(b"once").unwrap();
        assert!(b.decrypt(&packet).is_ok());
        assert!(matches!(b.decrypt(&packet), Err(SessionError::Replayed(_))));
    }

    #[test]
    fn test_out_of_order_within_window_accepted() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        let p0 = a.encrypt(b"zero").unwrap();
        let p1 = a.encrypt(b"one").unwrap();
        let p2 = a.encrypt(b"two").unwrap();

        assert_eq!(b.decrypt(&p2).unwrap(), b"two");
        assert_eq!(b.decrypt(&p0).unwrap(), b"zero");
        assert_eq!(b.decrypt(&p1).unwrap(), b"one");
        // Each exactly once.
        assert!(b.decrypt(&p0).is_err());
    }

    #[test]
    fn test_encrypt_requires_established() {
        let (mut a, _) = pair();
        assert!(matches!(
            a.encrypt(b"early"),
            Err(SessionError::NotEstablished(SessionState::NoSession))
        ));
    }

    #[test]
    fn test_garbage_handshake_discarded_silently() {
        let (mut a, mut b) = pair();

        let hs = a.initiate().unwrap();
        let forged = match hs {
            Packet::Handshake {
                sender,
                nonce,
                mut sealed_ephemeral,
            } => {
                sealed_ephemeral[5] ^= 0xff;
                Packet::Handshake {
                    sender,
                    nonce,
                    sealed_ephemeral,
                }
            }
            other => panic!("unexpected packet: {other:?}"),
        };

        assert!(b.handle_handshake(&forged).is_none());
        assert_eq!(b.state(), SessionState::NoSession);
    }

    #[test]
    fn test_handshake_from_wrong_identity_ignored() {
        let (_, mut b) = pair();
        let stranger = KeyPair::generate();
        let mut stranger_session =
            Session::new(stranger, *b.peer(), SessionConfig::default());
        let hs = stranger_session.initiate().unwrap();

        assert!(b.handle_handshake(&hs).is_none());
        assert_eq!(b.state(), SessionState::NoSession);
    }

    #[test]
    fn test_retransmitted_handshake_answered_without_rekeying() {
        let (mut a, mut b) = pair();
        let hs = a.initiate().unwrap();
        let reply = b.handle_handshake(&hs).unwrap();
        a.handle_handshake(&reply);

        // The same handshake again: re-answered identically, session
        // undisturbed.
        let re_reply = b.handle_handshake(&hs).expect("established side re-answers");
        assert_eq!(re_reply, reply);
        assert!(b.is_established());

        let packet = a.encrypt(b"still the same key").unwrap();
        assert_eq!(b.decrypt(&packet).unwrap(), b"still the same key");
    }

    #[test]
    fn test_lost_reply_recovered_by_retry() {
        let (mut a, mut b) = pair();
        let hs = a.initiate().unwrap();

        // The passive side's reply is lost in transit.
        let _lost = b.handle_handshake(&hs).expect("passive side replies");
        assert!(b.is_established());
        assert!(!a.is_established());

        // The initiator retries its identical handshake; the established
        // peer answers it again and the session completes.
        let retry = a.initiate().unwrap();
        let reply = b
            .handle_handshake(&retry)
            .expect("established side must re-answer a retransmitted handshake");
        assert!(a.handle_handshake(&reply).is_none());
        assert!(a.is_established());

        let packet = a.encrypt(b"recovered").unwrap();
        assert_eq!(b.decrypt(&packet).unwrap(), b"recovered");
    }

    #[test]
    fn test_initiate_retry_reemits_same_packet() {
        let (mut a, _) = pair();
        let first = a.initiate().unwrap();
        let second = a.initiate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_close_wipes_and_is_idempotent() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        a.close();
        assert_eq!(a.state(), SessionState::Closed);
        assert!(matches!(
            a.encrypt(b"dead"),
            Err(SessionError::NotEstablished(SessionState::Closed))
        ));

        // Closing again and timer work are no-ops.
        a.close();
        assert!(!a.check_timeout());
    }

    #[test]
    fn test_fresh_handshake_after_close_starts_over() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        b.close();

        // a starts a new session; b (closed) accepts and replies.
        let mut a2 = Session::new(a.local.clone(), *a.peer(), SessionConfig::default());
        let hs = a2.initiate().unwrap();
        let reply = b.handle_handshake(&hs).expect("closed session starts over");
        a2.handle_handshake(&reply);

        assert!(a2.is_established());
        assert!(b.is_established());
        let packet = a2.encrypt(b"again").unwrap();
        assert_eq!(b.decrypt(&packet).unwrap(), b"again");
    }

    #[test]
    fn test_immediate_timeout_closes() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let config = SessionConfig {
            timeout: Duration::from_secs(0),
            ..SessionConfig::default()
        };
        let mut sa = Session::new(a.clone(), b.public, config.clone());
        let mut sb = Session::new(b, a.public, config);

        let hs = sa.initiate().unwrap();
        let reply = sb.handle_handshake(&hs).unwrap();
        sa.handle_handshake(&reply);
        assert!(sa.is_established());

        std::thread::sleep(Duration::from_millis(5));
        assert!(sa.check_timeout());
        assert_eq!(sa.state(), SessionState::Closed);
    }
}
