// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic in-memory collaborators for driving distributors in tests:
//! a simulated sync collection with a virtual clock, a certificate domain
//! with capability chains and an Ed25519 signature manager.
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

use crate::cert::{Capability, Cert, Thumbprint, Validity};
use crate::crypto::Rng;
use crate::name::{Component, Name};
use crate::publication::Publication;
use crate::traits::{
    CertStore, ConfirmCb, KeyLookupCb, LifetimeCb, SigMgr, SigMgrError, SubscribeCb,
    SyncCollection, TimerCb, TimerHandle, ValidateCb,
};

/// Virtual time at which every simulated network starts.
pub const START_TIME: u64 = 1_600_000_000_000_000;

/// Simulated one-way delivery delay.
const LATENCY: u64 = 1_000;

const DEFAULT_PUB_LIFETIME: Duration = Duration::from_secs(3600);

type SharedSub = Rc<RefCell<SubscribeCb>>;

struct Event {
    at: u64,
    seq: u64,
    kind: EventKind,
}

enum EventKind {
    /// Broadcast to every reachable peer with a matching subscription.
    Deliver {
        from: usize,
        publication: Publication,
    },
    /// Targeted delivery to one already-resolved subscription.
    DeliverTo {
        to: usize,
        sub: SharedSub,
        publication: Publication,
    },
    Timer {
        cancelled: Rc<Cell<bool>>,
        cb: TimerCb,
    },
    Confirm {
        name: Name,
        cb: ConfirmCb,
    },
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct PeerState {
    subs: Vec<(Name, SharedSub)>,
    lifetime_cb: Option<LifetimeCb>,
    validator: Option<Rc<ValidateCb>>,
    pub_lifetime: Duration,
}

struct AlivePub {
    from: usize,
    expires: u64,
    publication: Publication,
}

struct NetState {
    now: u64,
    next_seq: u64,
    events: BinaryHeap<Reverse<Event>>,
    peers: Vec<PeerState>,
    alive: Vec<AlivePub>,
    blocked: HashSet<(usize, usize)>,
    log: Vec<Publication>,
}

impl NetState {
    fn push_event(&mut self, at: u64, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Reverse(Event { at, seq, kind }));
    }

    fn lifetime_of(&self, peer: usize, name: &Name) -> Duration {
        let state = &self.peers[peer];
        match &state.lifetime_cb {
            Some(cb) => cb(name),
            None => state.pub_lifetime,
        }
    }
}

/// A simulated sync collection shared by a set of peers, with a virtual
/// clock driving deliveries and timers.
///
/// Publications stay "alive" for their lifetime and are also handed to
/// late subscribers, which stands in for set reconciliation. Every
/// delivery first runs through the receiving peer's registered validator;
/// publications failing it are discarded. Nothing is ever delivered
/// synchronously from `publish` or `subscribe`; tests pump the network
/// with [`advance`](SimNet::advance).
pub struct SimNet {
    state: Rc<RefCell<NetState>>,
    collection: Name,
}

impl SimNet {
    pub fn new(collection: Name) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetState {
                now: START_TIME,
                next_seq: 0,
                events: BinaryHeap::new(),
                peers: Vec::new(),
                alive: Vec::new(),
                blocked: HashSet::new(),
                log: Vec::new(),
            })),
            collection,
        }
    }

    /// Adds a peer and returns its handle onto the collection.
    pub fn join(&self) -> Rc<SimSync> {
        let peer = {
            let mut st = self.state.borrow_mut();
            st.peers.push(PeerState {
                subs: Vec::new(),
                lifetime_cb: None,
                validator: None,
                pub_lifetime: DEFAULT_PUB_LIFETIME,
            });
            st.peers.len() - 1
        };
        Rc::new(SimSync {
            state: self.state.clone(),
            peer,
            collection: self.collection.clone(),
        })
    }

    pub fn now(&self) -> u64 {
        self.state.borrow().now
    }

    /// Runs the virtual clock forward, firing timers and deliveries in
    /// order.
    pub fn advance(&self, duration: Duration) {
        let target = self.state.borrow().now + duration.as_micros() as u64;
        loop {
            let event = {
                let mut st = self.state.borrow_mut();
                let due = matches!(st.events.peek(), Some(Reverse(event)) if event.at <= target);
                if !due {
                    break;
                }
                let Reverse(event) = st.events.pop().expect("peeked event exists");
                st.now = st.now.max(event.at);
                event
            };
            self.dispatch(event);
        }
        self.state.borrow_mut().now = target;
    }

    /// Blocks all traffic between two peers.
    pub fn partition(&self, a: &SimSync, b: &SimSync) {
        let mut st = self.state.borrow_mut();
        st.blocked.insert((a.peer, b.peer));
        st.blocked.insert((b.peer, a.peer));
    }

    /// Unblocks traffic between two peers and reconciles: publications
    /// still alive on either side get delivered across.
    pub fn heal(&self, a: &SimSync, b: &SimSync) {
        let mut st = self.state.borrow_mut();
        st.blocked.remove(&(a.peer, b.peer));
        st.blocked.remove(&(b.peer, a.peer));

        let now = st.now;
        let mut deliveries = Vec::new();
        for alive in &st.alive {
            if alive.expires <= now {
                continue;
            }
            let to = if alive.from == a.peer {
                b.peer
            } else if alive.from == b.peer {
                a.peer
            } else {
                continue;
            };
            for (prefix, sub) in &st.peers[to].subs {
                if prefix.is_prefix_of(alive.publication.name()) {
                    deliveries.push((to, sub.clone(), alive.publication.clone()));
                }
            }
        }
        for (to, sub, publication) in deliveries {
            st.push_event(now + LATENCY, EventKind::DeliverTo { to, sub, publication });
        }
    }

    /// Every publication seen by the collection, in publish order.
    pub fn published(&self) -> Vec<Publication> {
        self.state.borrow().log.clone()
    }

    fn dispatch(&self, event: Event) {
        match event.kind {
            EventKind::Deliver { from, publication } => {
                // Per receiving peer: its registered validator, then its
                // matching subscriptions.
                let targets: Vec<(Option<Rc<ValidateCb>>, Vec<SharedSub>)> = {
                    let st = self.state.borrow();
                    let mut targets = Vec::new();
                    for (id, peer) in st.peers.iter().enumerate() {
                        if id == from || st.blocked.contains(&(from, id)) {
                            continue;
                        }
                        let subs: Vec<SharedSub> = peer
                            .subs
                            .iter()
                            .filter(|(prefix, _)| prefix.is_prefix_of(publication.name()))
                            .map(|(_, sub)| sub.clone())
                            .collect();
                        if !subs.is_empty() {
                            targets.push((peer.validator.clone(), subs));
                        }
                    }
                    targets
                };
                for (validator, subs) in targets {
                    if !validated(&validator, &publication) {
                        continue;
                    }
                    for sub in subs {
                        (*sub.borrow_mut())(publication.clone());
                    }
                }
            }
            EventKind::DeliverTo {
                to,
                sub,
                publication,
            } => {
                let validator = self.state.borrow().peers[to].validator.clone();
                if validated(&validator, &publication) {
                    (*sub.borrow_mut())(publication);
                }
            }
            EventKind::Timer { cancelled, cb } => {
                if !cancelled.get() {
                    cb();
                }
            }
            EventKind::Confirm { name, cb } => {
                cb(name, true);
            }
        }
    }
}

/// One peer's handle onto a [`SimNet`] collection.
pub struct SimSync {
    state: Rc<RefCell<NetState>>,
    peer: usize,
    collection: Name,
}

impl SimSync {
    fn publish_inner(&self, publication: Publication, confirm: Option<ConfirmCb>) {
        let mut st = self.state.borrow_mut();
        let now = st.now;
        let lifetime = st.lifetime_of(self.peer, publication.name());
        st.log.push(publication.clone());
        st.alive.push(AlivePub {
            from: self.peer,
            expires: now + lifetime.as_micros() as u64,
            publication: publication.clone(),
        });
        st.push_event(
            now + LATENCY,
            EventKind::Deliver {
                from: self.peer,
                publication: publication.clone(),
            },
        );
        if let Some(cb) = confirm {
            st.push_event(
                now + LATENCY,
                EventKind::Confirm {
                    name: publication.name().clone(),
                    cb,
                },
            );
        }
    }
}

impl SyncCollection for SimSync {
    type Timer = SimTimer;

    fn collection_name(&self) -> &Name {
        &self.collection
    }

    fn now(&self) -> u64 {
        self.state.borrow().now
    }

    fn publish(&self, publication: Publication) {
        self.publish_inner(publication, None);
    }

    fn publish_confirm(&self, publication: Publication, confirm: ConfirmCb) {
        self.publish_inner(publication, Some(confirm));
    }

    fn subscribe(&self, prefix: Name, cb: SubscribeCb) {
        let mut st = self.state.borrow_mut();
        let sub: SharedSub = Rc::new(RefCell::new(cb));
        st.peers[self.peer]
            .subs
            .push((prefix.clone(), sub.clone()));

        // Late subscriber: replay what is still alive in the collection.
        let now = st.now;
        let mut deliveries = Vec::new();
        for alive in &st.alive {
            if alive.expires <= now
                || alive.from == self.peer
                || st.blocked.contains(&(alive.from, self.peer))
            {
                continue;
            }
            if prefix.is_prefix_of(alive.publication.name()) {
                deliveries.push(alive.publication.clone());
            }
        }
        for publication in deliveries {
            st.push_event(
                now + LATENCY,
                EventKind::DeliverTo {
                    to: self.peer,
                    sub: sub.clone(),
                    publication,
                },
            );
        }
    }

    fn unsubscribe(&self, prefix: &Name) {
        let mut st = self.state.borrow_mut();
        st.peers[self.peer].subs.retain(|(name, _)| name != prefix);
    }

    fn one_time(&self, delay: Duration, cb: TimerCb) {
        let mut st = self.state.borrow_mut();
        let at = st.now + delay.as_micros() as u64;
        st.push_event(
            at,
            EventKind::Timer {
                cancelled: Rc::new(Cell::new(false)),
                cb,
            },
        );
    }

    fn schedule(&self, delay: Duration, cb: TimerCb) -> SimTimer {
        let cancelled = Rc::new(Cell::new(false));
        let mut st = self.state.borrow_mut();
        let at = st.now + delay.as_micros() as u64;
        st.push_event(
            at,
            EventKind::Timer {
                cancelled: cancelled.clone(),
                cb,
            },
        );
        SimTimer { cancelled }
    }

    fn set_cstate_lifetime(&self, _lifetime: Duration) {}

    fn set_pub_lifetime(&self, lifetime: Duration) {
        self.state.borrow_mut().peers[self.peer].pub_lifetime = lifetime;
    }

    fn set_lifetime_cb(&self, cb: LifetimeCb) {
        self.state.borrow_mut().peers[self.peer].lifetime_cb = Some(cb);
    }

    fn set_validate_cb(&self, cb: ValidateCb) {
        self.state.borrow_mut().peers[self.peer].validator = Some(Rc::new(cb));
    }
}

fn validated(validator: &Option<Rc<ValidateCb>>, publication: &Publication) -> bool {
    match validator {
        Some(validate) => (**validate)(publication),
        None => true,
    }
}

pub struct SimTimer {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle for SimTimer {
    fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// A trust domain: an anchor certificate plus every identity chain issued
/// under it, shared by all peers' certificate stores.
pub struct SimDomain {
    certs: Rc<RefCell<HashMap<Thumbprint, Cert>>>,
    anchor: Thumbprint,
    domain: String,
    rng: Rng,
}

impl SimDomain {
    pub fn new(domain: &str, seed: [u8; 32]) -> Self {
        let rng = Rng::from_seed(seed);
        let anchor_cert = Cert {
            name: Name::from_str_parts(&[domain]),
            content: generate_key(&rng).1,
            validity: Validity {
                not_before: 0,
                not_after: u64::MAX,
            },
            capability: None,
            signer: None,
        };
        let anchor = anchor_cert.thumbprint();
        let certs = Rc::new(RefCell::new(HashMap::from([(anchor, anchor_cert)])));
        Self {
            certs,
            anchor,
            domain: domain.to_string(),
            rng,
        }
    }

    /// Issues an identity chain `anchor <- capability certs <- signing
    /// cert` and returns the identity with a certstore view onto the
    /// domain.
    pub fn identity(
        &self,
        role: &str,
        id: &str,
        caps: &[Capability],
        validity: Validity,
    ) -> SimIdentity {
        let mut signer = self.anchor;
        let base = Name::from_str_parts(&[self.domain.as_str(), role, id]);
        for cap in caps {
            let cert = Cert {
                name: base
                    .join(Component::str("caps"))
                    .join(Component::str(&cap.id)),
                content: generate_key(&self.rng).1,
                validity,
                capability: Some(cap.clone()),
                signer: Some(signer),
            };
            signer = cert.thumbprint();
            self.certs.borrow_mut().insert(signer, cert);
        }

        let (seed, public) = generate_key(&self.rng);
        let cert = Cert {
            name: base,
            content: public,
            validity,
            capability: None,
            signer: Some(signer),
        };
        let tp = cert.thumbprint();
        self.certs.borrow_mut().insert(tp, cert.clone());

        SimIdentity {
            tp,
            cert,
            signing_secret: seed.to_vec(),
            certs: self.certs.clone(),
        }
    }
}

fn generate_key(rng: &Rng) -> ([u8; 32], Vec<u8>) {
    let seed: [u8; 32] = rng.random_array().expect("rng never fails in tests");
    let key = SigningKey::from_bytes(&seed);
    (seed, key.verifying_key().as_bytes().to_vec())
}

/// An issued identity: its thumbprint, signing cert and secret, plus a
/// certstore view for the owning peer.
pub struct SimIdentity {
    pub tp: Thumbprint,
    pub cert: Cert,
    pub signing_secret: Vec<u8>,
    certs: Rc<RefCell<HashMap<Thumbprint, Cert>>>,
}

impl SimIdentity {
    pub fn certstore(&self) -> Rc<SimCertStore> {
        Rc::new(SimCertStore {
            certs: self.certs.clone(),
            chain: vec![self.tp],
            secrets: HashMap::from([(self.tp, self.signing_secret.clone())]),
        })
    }
}

/// Per-peer view onto the domain's certificates.
pub struct SimCertStore {
    certs: Rc<RefCell<HashMap<Thumbprint, Cert>>>,
    chain: Vec<Thumbprint>,
    secrets: HashMap<Thumbprint, Vec<u8>>,
}

impl CertStore for SimCertStore {
    fn chains(&self) -> Vec<Thumbprint> {
        self.chain.clone()
    }

    fn key(&self, tp: &Thumbprint) -> Option<Vec<u8>> {
        self.secrets.get(tp).cloned()
    }

    fn get(&self, tp: &Thumbprint) -> Option<Cert> {
        self.certs.borrow().get(tp).cloned()
    }
}

/// Ed25519 signature manager over a publication's signed portion.
#[derive(Default)]
pub struct EdSigMgr {
    key: Option<(SigningKey, Thumbprint)>,
    lookup: Option<KeyLookupCb>,
}

impl EdSigMgr {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SigMgr for EdSigMgr {
    fn sign(&self, publication: &mut Publication) -> Result<(), SigMgrError> {
        let (key, tp) = self.key.as_ref().ok_or(SigMgrError::NotConfigured)?;
        publication.set_signature(*tp, Vec::new());
        let signature = key.sign(&publication.signed_portion());
        publication.set_signature(*tp, signature.to_bytes().to_vec());
        Ok(())
    }

    fn validate(&self, publication: &Publication) -> bool {
        let Some(lookup) = &self.lookup else {
            return false;
        };
        let Some(public) = lookup(publication) else {
            return false;
        };
        let Ok(public) = <[u8; 32]>::try_from(public.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&public) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(publication.signature()) else {
            return false;
        };
        key.verify_strict(&publication.signed_portion(), &signature)
            .is_ok()
    }

    fn update_signing_key(&mut self, secret: &[u8], cert: &Cert) -> Result<(), SigMgrError> {
        let seed: [u8; 32] = secret
            .get(..32)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(SigMgrError::BadSigningKey)?;
        let key = SigningKey::from_bytes(&seed);
        if key.verifying_key().as_bytes() != cert.content.as_slice() {
            return Err(SigMgrError::BadSigningKey);
        }
        self.key = Some((key, cert.thumbprint()));
        Ok(())
    }

    fn set_key_cb(&mut self, cb: KeyLookupCb) {
        self.lookup = Some(cb);
    }
}
