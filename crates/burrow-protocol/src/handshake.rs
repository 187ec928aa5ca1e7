//! # Noise-IKpsk2 Handshake
//!
//! Per-peer handshake state driving the key agreement. The initiator side
//! creates initiations and consumes responses; the responder side consumes
//! initiations and creates responses. Both end in a [`SessionKeys`] pair the
//! engine turns into a transport key-pair.
//!
//! Consuming an initiation is a two-step affair: the message authenticates a
//! remote static key the caller has not resolved to a peer yet, so
//! [`consume_initiation`] is a free function returning the authenticated
//! identity plus opaque state, and the caller applies that state to the
//! matching peer's [`Handshake`] once it has looked the peer up.

use crate::constants::{
    ENCRYPTED_EMPTY_SIZE, ENCRYPTED_STATIC_SIZE, ENCRYPTED_TIMESTAMP_SIZE, KEY_SIZE,
};
use crate::messages::{MessageInitiation, MessageResponse, Tai64n};
use crate::noise::{NoiseError, SymmetricState, NOISE_CONSTRUCTION, NOISE_IDENTIFIER};

use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

// ═══════════════════════════════════════════════════════════════════════════
// STATIC KEYS
// ═══════════════════════════════════════════════════════════════════════════

/// The device's static X25519 key pair
pub struct StaticKeys {
    private: Zeroizing<[u8; KEY_SIZE]>,
    public: [u8; KEY_SIZE],
}

impl StaticKeys {
    /// Build from a raw private key
    pub fn from_private(private: [u8; KEY_SIZE]) -> Self {
        let public = derive_public(&private);
        Self {
            private: Zeroizing::new(private),
            public,
        }
    }

    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        use x25519_dalek::StaticSecret;
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_private(secret.to_bytes())
    }

    /// The public half
    pub fn public(&self) -> &[u8; KEY_SIZE] {
        &self.public
    }

    /// The private half
    pub fn private(&self) -> &[u8; KEY_SIZE] {
        &self.private
    }
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SESSION KEYS
// ═══════════════════════════════════════════════════════════════════════════

/// Output of a completed handshake: directional transport keys plus the
/// session indices the transport headers will carry
pub struct SessionKeys {
    /// Key for the sending direction
    pub send: Zeroizing<[u8; KEY_SIZE]>,
    /// Key for the receiving direction
    pub receive: Zeroizing<[u8; KEY_SIZE]>,
    /// Our receiver id (the other side addresses us with this)
    pub local_index: u32,
    /// The other side's receiver id
    pub remote_index: u32,
    /// Whether we initiated the handshake
    pub is_initiator: bool,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HANDSHAKE STATE
// ═══════════════════════════════════════════════════════════════════════════

enum State {
    Empty,
    InitiationCreated {
        ephemeral_private: Zeroizing<[u8; KEY_SIZE]>,
        sym: SymmetricState,
    },
    InitiationConsumed {
        remote_ephemeral: [u8; KEY_SIZE],
        sym: SymmetricState,
    },
}

/// Per-peer handshake state
pub struct Handshake {
    remote_static: [u8; KEY_SIZE],
    preshared_key: Zeroizing<[u8; KEY_SIZE]>,
    local_index: u32,
    remote_index: u32,
    last_timestamp: Option<Tai64n>,
    state: State,
}

impl Handshake {
    /// New handshake state for a peer identified by its static public key.
    /// The preshared key defaults to all zeros (always mixed).
    pub fn new(remote_static: [u8; KEY_SIZE]) -> Self {
        Self {
            remote_static,
            preshared_key: Zeroizing::new([0u8; KEY_SIZE]),
            local_index: 0,
            remote_index: 0,
            last_timestamp: None,
            state: State::Empty,
        }
    }

    /// The peer's static public key
    pub fn remote_static(&self) -> &[u8; KEY_SIZE] {
        &self.remote_static
    }

    /// Install a preshared key (IKpsk2 slot)
    pub fn set_preshared_key(&mut self, psk: [u8; KEY_SIZE]) {
        self.preshared_key = Zeroizing::new(psk);
    }

    /// Current preshared key (zeros when unset)
    pub fn preshared_key(&self) -> [u8; KEY_SIZE] {
        *self.preshared_key
    }

    /// Our session index for the in-flight handshake
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// Assign our session index; the caller owns index allocation
    pub fn set_local_index(&mut self, index: u32) {
        self.local_index = index;
    }

    /// Drop any in-flight state (e.g. after the device key changed)
    pub fn clear(&mut self) {
        self.state = State::Empty;
        self.local_index = 0;
        self.remote_index = 0;
    }

    /// Create an initiation message.
    ///
    /// `-> e, es, s, ss`. The caller appends the MACs and sends.
    pub fn create_initiation(
        &mut self,
        keys: &StaticKeys,
    ) -> Result<MessageInitiation, NoiseError> {
        let (ephemeral_private, ephemeral_public) = generate_ephemeral();

        let mut sym = SymmetricState::new(NOISE_CONSTRUCTION);
        sym.mix_hash(NOISE_IDENTIFIER);
        sym.mix_hash(&self.remote_static);

        // -> e
        sym.mix_hash(&ephemeral_public);

        // -> es
        let es = dh(&ephemeral_private, &self.remote_static)?;
        sym.mix_key(&es);

        // -> s
        let encrypted_static = sym.encrypt_and_hash(keys.public())?;
        let encrypted_static = fixed::<ENCRYPTED_STATIC_SIZE>(&encrypted_static)?;

        // -> ss
        let ss = dh(keys.private(), &self.remote_static)?;
        sym.mix_key(&ss);

        let timestamp = Tai64n::now();
        let encrypted_timestamp = sym.encrypt_and_hash(timestamp.as_bytes())?;
        let encrypted_timestamp = fixed::<ENCRYPTED_TIMESTAMP_SIZE>(&encrypted_timestamp)?;

        self.state = State::InitiationCreated {
            ephemeral_private,
            sym,
        };

        Ok(MessageInitiation {
            sender_index: self.local_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Install the state of a consumed initiation on this peer's handshake.
    ///
    /// Verifies the authenticated identity matches this peer and that the
    /// timestamp advances (initiation-replay defence).
    pub fn apply_initiation(&mut self, incoming: IncomingInitiation) -> Result<(), NoiseError> {
        if incoming.remote_static != self.remote_static {
            return Err(NoiseError::HandshakeFailed);
        }
        if let Some(last) = &self.last_timestamp {
            if !incoming.timestamp.is_newer_than(last) {
                return Err(NoiseError::StaleTimestamp);
            }
        }
        self.last_timestamp = Some(incoming.timestamp);
        self.remote_index = incoming.sender_index;
        self.state = State::InitiationConsumed {
            remote_ephemeral: incoming.remote_ephemeral,
            sym: incoming.sym,
        };
        Ok(())
    }

    /// Create the response to a previously applied initiation.
    ///
    /// `<- e, ee, se, psk`. Returns the message (MACs still zero) and the
    /// derived transport keys for the responder role.
    pub fn create_response(
        &mut self,
        _keys: &StaticKeys,
    ) -> Result<(MessageResponse, SessionKeys), NoiseError> {
        let (remote_ephemeral, mut sym) = match std::mem::replace(&mut self.state, State::Empty) {
            State::InitiationConsumed {
                remote_ephemeral,
                sym,
            } => (remote_ephemeral, sym),
            other => {
                self.state = other;
                return Err(NoiseError::InvalidState);
            }
        };

        let (ephemeral_private, ephemeral_public) = generate_ephemeral();

        // <- e
        sym.mix_hash(&ephemeral_public);

        // <- ee
        let ee = dh(&ephemeral_private, &remote_ephemeral)?;
        sym.mix_key(&ee);

        // <- se
        let se = dh(&ephemeral_private, &self.remote_static)?;
        sym.mix_key(&se);

        // psk2
        sym.mix_psk(&self.preshared_key);

        let encrypted_empty = sym.encrypt_and_hash(&[])?;
        let encrypted_empty = fixed::<ENCRYPTED_EMPTY_SIZE>(&encrypted_empty)?;

        let (initiator_to_responder, responder_to_initiator) = sym.split();

        let message = MessageResponse {
            sender_index: self.local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            encrypted_empty,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        let session = SessionKeys {
            send: responder_to_initiator,
            receive: initiator_to_responder,
            local_index: self.local_index,
            remote_index: self.remote_index,
            is_initiator: false,
        };

        Ok((message, session))
    }

    /// Consume a response to our in-flight initiation.
    ///
    /// `<- e, ee, se, psk` mirror. Returns the derived transport keys for
    /// the initiator role. A response that fails to authenticate leaves the
    /// in-flight initiation intact.
    pub fn consume_response(
        &mut self,
        keys: &StaticKeys,
        msg: &MessageResponse,
    ) -> Result<SessionKeys, NoiseError> {
        let (ephemeral_private, sym) = match &self.state {
            State::InitiationCreated {
                ephemeral_private,
                sym,
            } => (ephemeral_private, sym),
            _ => return Err(NoiseError::InvalidState),
        };
        if msg.receiver_index != self.local_index {
            return Err(NoiseError::HandshakeFailed);
        }

        let mut sym = sym.clone();

        // <- e
        sym.mix_hash(&msg.ephemeral_public);

        // <- ee
        let ee = dh(ephemeral_private, &msg.ephemeral_public)?;
        sym.mix_key(&ee);

        // <- se
        let se = dh(keys.private(), &msg.ephemeral_public)?;
        sym.mix_key(&se);

        // psk2
        sym.mix_psk(&self.preshared_key);

        // key confirmation
        let empty = sym.decrypt_and_hash(&msg.encrypted_empty)?;
        if !empty.is_empty() {
            return Err(NoiseError::HandshakeFailed);
        }

        self.remote_index = msg.sender_index;
        self.state = State::Empty;

        let (initiator_to_responder, responder_to_initiator) = sym.split();

        Ok(SessionKeys {
            send: initiator_to_responder,
            receive: responder_to_initiator,
            local_index: self.local_index,
            remote_index: msg.sender_index,
            is_initiator: true,
        })
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INITIATION CONSUMPTION (device level)
// ═══════════════════════════════════════════════════════════════════════════

/// An initiation that authenticated against our static key, not yet bound to
/// a peer
pub struct IncomingInitiation {
    /// The initiator's authenticated static public key
    pub remote_static: [u8; KEY_SIZE],
    timestamp: Tai64n,
    sender_index: u32,
    remote_ephemeral: [u8; KEY_SIZE],
    sym: SymmetricState,
}

impl std::fmt::Debug for IncomingInitiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingInitiation")
            .field("sender_index", &self.sender_index)
            .finish_non_exhaustive()
    }
}

/// Consume an initiation message addressed to `keys`.
///
/// `-> e, es, s, ss` mirror. On success the caller resolves
/// `remote_static` to a peer and calls [`Handshake::apply_initiation`].
pub fn consume_initiation(
    keys: &StaticKeys,
    msg: &MessageInitiation,
) -> Result<IncomingInitiation, NoiseError> {
    let mut sym = SymmetricState::new(NOISE_CONSTRUCTION);
    sym.mix_hash(NOISE_IDENTIFIER);
    sym.mix_hash(keys.public());

    // -> e
    sym.mix_hash(&msg.ephemeral_public);

    // -> es
    let es = dh(keys.private(), &msg.ephemeral_public)?;
    sym.mix_key(&es);

    // -> s
    let static_bytes = sym.decrypt_and_hash(&msg.encrypted_static)?;
    if static_bytes.len() != KEY_SIZE {
        return Err(NoiseError::InvalidLength {
            expected: KEY_SIZE,
            got: static_bytes.len(),
        });
    }
    let mut remote_static = [0u8; KEY_SIZE];
    remote_static.copy_from_slice(&static_bytes);

    // -> ss
    let ss = dh(keys.private(), &remote_static)?;
    sym.mix_key(&ss);

    let timestamp_bytes = sym.decrypt_and_hash(&msg.encrypted_timestamp)?;
    let timestamp = Tai64n::from_bytes(&timestamp_bytes).ok_or(NoiseError::HandshakeFailed)?;

    Ok(IncomingInitiation {
        remote_static,
        timestamp,
        sender_index: msg.sender_index,
        remote_ephemeral: msg.ephemeral_public,
        sym,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Derive an X25519 public key from a private key
pub fn derive_public(private: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(*private);
    let public = PublicKey::from(&secret);
    *public.as_bytes()
}

/// X25519 Diffie-Hellman with a zero-output guard
fn dh(private: &[u8; KEY_SIZE], public: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE], NoiseError> {
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(*private);
    let their_public = PublicKey::from(*public);
    let shared = secret.diffie_hellman(&their_public);

    if shared.as_bytes().iter().all(|&b| b == 0) {
        return Err(NoiseError::ZeroDhOutput);
    }

    Ok(*shared.as_bytes())
}

fn generate_ephemeral() -> (Zeroizing<[u8; KEY_SIZE]>, [u8; KEY_SIZE]) {
    let mut private = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut private);
    let public = derive_public(&private);
    (Zeroizing::new(private), public)
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], NoiseError> {
    if data.len() != N {
        return Err(NoiseError::InvalidLength {
            expected: N,
            got: data.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(data);
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (StaticKeys, StaticKeys) {
        (StaticKeys::generate(), StaticKeys::generate())
    }

    fn run_handshake(
        initiator_keys: &StaticKeys,
        responder_keys: &StaticKeys,
        psk: Option<[u8; 32]>,
    ) -> (SessionKeys, SessionKeys) {
        let mut initiator = Handshake::new(*responder_keys.public());
        let mut responder = Handshake::new(*initiator_keys.public());
        initiator.set_local_index(101);
        responder.set_local_index(202);
        if let Some(psk) = psk {
            initiator.set_preshared_key(psk);
            responder.set_preshared_key(psk);
        }

        let init = initiator.create_initiation(initiator_keys).unwrap();

        let incoming = consume_initiation(responder_keys, &init).unwrap();
        assert_eq!(&incoming.remote_static, initiator_keys.public());
        responder.apply_initiation(incoming).unwrap();

        let (response, responder_session) = responder.create_response(responder_keys).unwrap();
        let initiator_session = initiator
            .consume_response(initiator_keys, &response)
            .unwrap();

        (initiator_session, responder_session)
    }

    #[test]
    fn test_full_handshake_mirrors_keys() {
        let (ikeys, rkeys) = pair();
        let (i, r) = run_handshake(&ikeys, &rkeys, None);

        assert_eq!(&*i.send, &*r.receive);
        assert_eq!(&*i.receive, &*r.send);
        assert!(i.is_initiator);
        assert!(!r.is_initiator);
    }

    #[test]
    fn test_handshake_indices() {
        let (ikeys, rkeys) = pair();
        let (i, r) = run_handshake(&ikeys, &rkeys, None);

        assert_eq!(i.local_index, 101);
        assert_eq!(i.remote_index, 202);
        assert_eq!(r.local_index, 202);
        assert_eq!(r.remote_index, 101);
    }

    #[test]
    fn test_handshake_with_preshared_key() {
        let (ikeys, rkeys) = pair();
        let (i, r) = run_handshake(&ikeys, &rkeys, Some([0x5Au8; 32]));
        assert_eq!(&*i.send, &*r.receive);
    }

    #[test]
    fn test_preshared_key_mismatch_fails() {
        let (ikeys, rkeys) = pair();

        let mut initiator = Handshake::new(*rkeys.public());
        let mut responder = Handshake::new(*ikeys.public());
        initiator.set_preshared_key([1u8; 32]);
        responder.set_preshared_key([2u8; 32]);

        let init = initiator.create_initiation(&ikeys).unwrap();
        let incoming = consume_initiation(&rkeys, &init).unwrap();
        responder.apply_initiation(incoming).unwrap();
        let (response, _) = responder.create_response(&rkeys).unwrap();

        assert!(initiator.consume_response(&ikeys, &response).is_err());
    }

    #[test]
    fn test_initiation_for_other_device_fails() {
        let (ikeys, rkeys) = pair();
        let other = StaticKeys::generate();

        let mut initiator = Handshake::new(*rkeys.public());
        let init = initiator.create_initiation(&ikeys).unwrap();

        assert!(consume_initiation(&other, &init).is_err());
    }

    #[test]
    fn test_replayed_initiation_rejected() {
        let (ikeys, rkeys) = pair();

        let mut initiator = Handshake::new(*rkeys.public());
        let mut responder = Handshake::new(*ikeys.public());

        let init = initiator.create_initiation(&ikeys).unwrap();

        let first = consume_initiation(&rkeys, &init).unwrap();
        responder.apply_initiation(first).unwrap();

        // identical datagram again: same timestamp, not newer
        let replayed = consume_initiation(&rkeys, &init).unwrap();
        assert_eq!(
            responder.apply_initiation(replayed),
            Err(NoiseError::StaleTimestamp)
        );
    }

    #[test]
    fn test_initiation_from_unknown_peer_detected() {
        let (ikeys, rkeys) = pair();
        let stranger = StaticKeys::generate();

        // responder only knows `stranger`, but the initiation comes from ikeys
        let mut responder = Handshake::new(*stranger.public());

        let mut initiator = Handshake::new(*rkeys.public());
        let init = initiator.create_initiation(&ikeys).unwrap();
        let incoming = consume_initiation(&rkeys, &init).unwrap();

        assert!(responder.apply_initiation(incoming).is_err());
    }

    #[test]
    fn test_response_wrong_receiver_index() {
        let (ikeys, rkeys) = pair();

        let mut initiator = Handshake::new(*rkeys.public());
        let mut responder = Handshake::new(*ikeys.public());
        initiator.set_local_index(7);

        let init = initiator.create_initiation(&ikeys).unwrap();
        let incoming = consume_initiation(&rkeys, &init).unwrap();
        responder.apply_initiation(incoming).unwrap();
        let (mut response, _) = responder.create_response(&rkeys).unwrap();

        response.receiver_index ^= 1;
        assert!(initiator.consume_response(&ikeys, &response).is_err());
    }

    #[test]
    fn test_forged_response_keeps_initiation_alive() {
        let (ikeys, rkeys) = pair();

        let mut initiator = Handshake::new(*rkeys.public());
        let mut responder = Handshake::new(*ikeys.public());

        let init = initiator.create_initiation(&ikeys).unwrap();
        let incoming = consume_initiation(&rkeys, &init).unwrap();
        responder.apply_initiation(incoming).unwrap();
        let (response, _) = responder.create_response(&rkeys).unwrap();

        // a corrupted response must not destroy the in-flight initiation
        let mut forged = response.clone();
        forged.encrypted_empty[0] ^= 1;
        assert!(initiator.consume_response(&ikeys, &forged).is_err());

        // the genuine response still completes
        assert!(initiator.consume_response(&ikeys, &response).is_ok());
    }

    #[test]
    fn test_create_response_requires_initiation() {
        let (_, rkeys) = pair();
        let mut handshake = Handshake::new(*StaticKeys::generate().public());
        assert!(handshake.create_response(&rkeys).is_err());
    }

    #[test]
    fn test_derive_public_deterministic() {
        let keys = StaticKeys::generate();
        assert_eq!(derive_public(keys.private()), *keys.public());
    }
}
