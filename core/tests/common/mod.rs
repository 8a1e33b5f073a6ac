#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use coinshuffle_core::mock::{MemoryNetwork, MemoryTransport, MockCrypto, MockLedger};
use coinshuffle_core::{
    Address, Crypto, DecryptionKey, EncryptionKey, Message, NetworkConfig, Packet, Phase, Result,
    Session, SessionConfig, SessionId, SessionOutcome, Signature, SigningKey, Transaction, Transport,
    TransportError, VerificationKey,
};

pub const AMOUNT: u64 = 1_000;

pub struct TestFixture {
    pub crypto: Arc<MockCrypto>,
    pub ledger: Arc<MockLedger>,
    pub network: MemoryNetwork,
    pub session: SessionId,
    pub config: SessionConfig,
    /// Sorted by verification key, so index `i` is player number `i + 1`
    pub players: Vec<(SigningKey, VerificationKey)>,
}

impl TestFixture {
    /// `n` players, each funded with exactly the session amount
    pub fn new(n: usize, seed: u64) -> Self {
        let crypto = Arc::new(MockCrypto::new(seed));
        let ledger = Arc::new(MockLedger::new());
        let mut players: Vec<(SigningKey, VerificationKey)> = (0..n)
            .map(|_| {
                let key = crypto.make_signing_key();
                let vk = crypto.verification_key(&key);
                (key, vk)
            })
            .collect();
        players.sort_by_key(|(_, vk)| *vk);

        for (_, vk) in &players {
            ledger.fund(crypto.address(vk), AMOUNT);
        }

        Self {
            crypto,
            ledger,
            network: MemoryNetwork::from_config(&NetworkConfig {
                receive_timeout_ms: 250,
            }),
            session: SessionId::from_label(&format!("scenario-{seed}")),
            config: SessionConfig {
                amount: AMOUNT,
                max_retries: 0,
                min_players: n.min(3),
            },
            players,
        }
    }

    pub fn vk(&self, i: usize) -> VerificationKey {
        self.players[i].1
    }

    pub fn address(&self, i: usize) -> Address {
        self.crypto.address(&self.vk(i))
    }

    pub fn player_set(&self) -> BTreeSet<VerificationKey> {
        self.players.iter().map(|(_, vk)| *vk).collect()
    }

    pub fn endpoint(&self, i: usize) -> MemoryTransport {
        self.network.endpoint(self.vk(i))
    }

    pub fn session_with(
        &self,
        i: usize,
        crypto: Arc<dyn Crypto>,
        transport: Box<dyn Transport>,
    ) -> Session {
        Session::new(
            self.session,
            self.players[i].0.clone(),
            self.player_set(),
            self.config.clone(),
            crypto,
            self.ledger.clone(),
            transport,
        )
        .unwrap()
    }

    pub fn honest_session(&self, i: usize) -> Session {
        self.session_with(i, self.crypto.clone(), Box::new(self.endpoint(i)))
    }

    pub fn honest_sessions(&self) -> Vec<Session> {
        (0..self.players.len()).map(|i| self.honest_session(i)).collect()
    }
}

/// Run every session on its own thread; results keep the input order
pub fn run_all(sessions: Vec<Session>) -> Vec<(Session, SessionOutcome)> {
    thread::scope(|scope| {
        let handles: Vec<_> = sessions
            .into_iter()
            .map(|mut session| {
                scope.spawn(move || {
                    let outcome = session.run();
                    (session, outcome)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}

// ============================================================================
// Faulty collaborators
// ============================================================================

/// Drops the first address of every BroadcastOutput packet it sends
pub struct DroppingTransport {
    pub inner: MemoryTransport,
}

impl Transport for DroppingTransport {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> std::result::Result<(), TransportError> {
        if packet.phase != Phase::BroadcastOutput {
            return self.inner.send_to(recipient, packet);
        }
        let mut tampered = packet.clone();
        tampered.message =
            Message::from_elements(packet.message.elements().iter().skip(1).cloned().collect());
        self.inner.send_to(recipient, &tampered)
    }

    fn receive(&mut self) -> std::result::Result<Packet, TransportError> {
        self.inner.receive()
    }
}

/// Announces a different encryption key to `target` than to everyone else
pub struct EquivocatingTransport {
    pub inner: MemoryTransport,
    pub target: VerificationKey,
}

impl Transport for EquivocatingTransport {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> std::result::Result<(), TransportError> {
        if packet.phase != Phase::Announcement || *recipient != self.target {
            return self.inner.send_to(recipient, packet);
        }
        let mut tampered = packet.clone();
        tampered.message = Message::new().attach(EncryptionKey([0x5A; 32]));
        self.inner.send_to(recipient, &tampered)
    }

    fn receive(&mut self) -> std::result::Result<Packet, TransportError> {
        self.inner.receive()
    }
}

/// Sends an address where its signature should be
pub struct GarblingTransport {
    pub inner: MemoryTransport,
}

impl Transport for GarblingTransport {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> std::result::Result<(), TransportError> {
        if packet.phase != Phase::VerificationAndSubmission {
            return self.inner.send_to(recipient, packet);
        }
        let mut tampered = packet.clone();
        tampered.message = Message::new().attach(Address(b"not a signature".to_vec()));
        self.inner.send_to(recipient, &tampered)
    }

    fn receive(&mut self) -> std::result::Result<Packet, TransportError> {
        self.inner.receive()
    }
}

/// Honest in every respect except that its signatures are garbage
pub struct ForgingCrypto {
    pub inner: Arc<MockCrypto>,
}

impl Crypto for ForgingCrypto {
    fn make_decryption_key(&self) -> DecryptionKey {
        self.inner.make_decryption_key()
    }

    fn make_signing_key(&self) -> SigningKey {
        self.inner.make_signing_key()
    }

    fn random(&self, max_inclusive: usize) -> usize {
        self.inner.random(max_inclusive)
    }

    fn hash(&self, message: &Message) -> Message {
        self.inner.hash(message)
    }

    fn encryption_key(&self, key: &DecryptionKey) -> EncryptionKey {
        self.inner.encryption_key(key)
    }

    fn encrypt(&self, key: &EncryptionKey, address: &Address) -> Result<Address> {
        self.inner.encrypt(key, address)
    }

    fn decrypt(&self, key: &DecryptionKey, address: &Address) -> Result<Address> {
        self.inner.decrypt(key, address)
    }

    fn verification_key(&self, key: &SigningKey) -> VerificationKey {
        self.inner.verification_key(key)
    }

    fn sign(&self, _key: &SigningKey, _transaction: &Transaction) -> Result<Signature> {
        Ok(Signature(vec![0xAA; 32]))
    }

    fn verify(&self, key: &VerificationKey, transaction: &Transaction, signature: &Signature) -> bool {
        self.inner.verify(key, transaction, signature)
    }

    fn address(&self, key: &VerificationKey) -> Address {
        self.inner.address(key)
    }
}

/// Forwards the first onion it is asked to peel with the layer still on
pub struct LazyRelayCrypto {
    pub inner: Arc<MockCrypto>,
    pub skipped: AtomicBool,
}

impl LazyRelayCrypto {
    pub fn new(inner: Arc<MockCrypto>) -> Self {
        Self {
            inner,
            skipped: AtomicBool::new(false),
        }
    }
}

impl Crypto for LazyRelayCrypto {
    fn make_decryption_key(&self) -> DecryptionKey {
        self.inner.make_decryption_key()
    }

    fn make_signing_key(&self) -> SigningKey {
        self.inner.make_signing_key()
    }

    fn random(&self, max_inclusive: usize) -> usize {
        self.inner.random(max_inclusive)
    }

    fn hash(&self, message: &Message) -> Message {
        self.inner.hash(message)
    }

    fn encryption_key(&self, key: &DecryptionKey) -> EncryptionKey {
        self.inner.encryption_key(key)
    }

    fn encrypt(&self, key: &EncryptionKey, address: &Address) -> Result<Address> {
        self.inner.encrypt(key, address)
    }

    fn decrypt(&self, key: &DecryptionKey, address: &Address) -> Result<Address> {
        if !self.skipped.swap(true, Ordering::SeqCst) {
            return Ok(address.clone());
        }
        self.inner.decrypt(key, address)
    }

    fn verification_key(&self, key: &SigningKey) -> VerificationKey {
        self.inner.verification_key(key)
    }

    fn sign(&self, key: &SigningKey, transaction: &Transaction) -> Result<Signature> {
        self.inner.sign(key, transaction)
    }

    fn verify(&self, key: &VerificationKey, transaction: &Transaction, signature: &Signature) -> bool {
        self.inner.verify(key, transaction, signature)
    }

    fn address(&self, key: &VerificationKey) -> Address {
        self.inner.address(key)
    }
}
