// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subscriber-group key distribution.
//!
//! A trust domain grants a subset of its identities the subscriber-group
//! capability; only those may read encrypted publications, everybody else
//! publishes blind. One elected keymaker per collection generates an X25519
//! key pair, seals the secret half towards every enrolled member and
//! publishes the records over the sync collection, rekeying periodically.
//! Members enroll with signed membership requests; publish-only peers pick
//! the public key out of any key record.
//!
//! The distributor moves through `init → (keymaker | subscriber | publisher)
//! → ready`. Readiness per role: a keymaker needs one confirmed key-record
//! delivery (or an enrolled member), a subscriber needs a decrypted group
//! key, a pure publisher needs the group public key. The `connected`
//! callback fires exactly once, at that moment.
//!
//! Concurrent keymakers can come out of partitioned starts; conflicts
//! resolve deterministically, the greater thumbprint keeps the role and the
//! other side re-enrolls as a member.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::capability::{
    KEYMAKER, KEYMAKER_PUBS, SUBSCRIBER_GROUP, capability_argument, keymaker_priority,
};
use crate::cert::{Cert, THUMBPRINT_SIZE, Thumbprint};
use crate::crypto::x25519::{self, PublicKey, SecretKey};
use crate::crypto::{Rng, sealed_box};
use crate::election::{ElectionDoneCb, KmElection, PriorityCb};
use crate::name::{Component, Name};
use crate::publication::Publication;
use crate::records::{
    EncryptedKeyRecord, KeyRecordContent, RANGE_ID_SIZE, key_record_name, max_records_per_pub,
    membership_request_name, parse_key_record_name,
};
use crate::traits::{CertStore, SigMgr, SigMgrError, SyncCollection, TimerHandle};

/// Receives every accepted group key change as `(public key, secret key,
/// creation time)`; the secret half is empty for publish-only peers.
pub type AddKeyCb = Rc<dyn Fn(&[u8], &[u8], u64)>;

/// Invoked exactly once when the entity reaches operational state.
pub type ConnectedCb = Box<dyn FnOnce(bool)>;

/// Lifetime of the sync collection's current-state packets.
const CSTATE_LIFETIME: Duration = Duration::from_millis(253);

/// Lifetime of membership-request publications.
const MR_LIFETIME: Duration = Duration::from_millis(6000);

/// Lifetime of election candidacy publications.
const CANDIDACY_LIFETIME: Duration = Duration::from_millis(1000);

/// Delay before nudging the keymaker with a membership request after seeing
/// a fresh key record that does not cover us.
const MR_NUDGE_DELAY: Duration = Duration::from_millis(2000);

/// Election settling window for secret-key subcollections.
const SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Election settling window for the public-keys collection.
const PUBS_SETTLE_WINDOW: Duration = Duration::from_secs(5);

/// Member count stays below this multiple of the per-publication record
/// capacity, keeping shard counts inside the reconciliation's peeling
/// threshold.
const MEMBER_LIMIT_FACTOR: usize = 80;

/// Collection name component that selects the public-keys flavor of the
/// distributor.
const PUBS_COLLECTION: &str = "pubs";

/// Timing knobs for key distribution.
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval between scheduled rekeys.
    pub rekey_interval: Duration,

    /// Slack added to the rekey interval when deriving publication
    /// lifetimes.
    pub rekey_randomize: Duration,

    /// Extra slack on top of the key lifetime before publications expire
    /// out of the collection.
    pub expiration_guard_band: Duration,

    /// Upper bound on the size of one publication; determines how many
    /// encrypted records fit into one key-record shard.
    pub max_pub_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rekey_interval: Duration::from_secs(3600),
            rekey_randomize: Duration::from_secs(10),
            expiration_guard_band: Duration::from_secs(60),
            max_pub_size: 1024,
        }
    }
}

/// Distributes a subscriber-group key pair to the authorized peers of one
/// collection.
///
/// Dropping the distributor cancels all of its pending timers and
/// subscriptions; callbacks registered with the sync collection are bound to
/// its lifetime and never fire afterwards.
pub struct SgKeyDistributor<S, C, M>
where
    S: SyncCollection + 'static,
    C: CertStore + 'static,
    M: SigMgr + 'static,
{
    inner: Rc<RefCell<Inner<S, C, M>>>,
}

struct Inner<S, C, M>
where
    S: SyncCollection + 'static,
    C: CertStore + 'static,
    M: SigMgr + 'static,
{
    sync: Rc<S>,
    certs: Rc<C>,
    sync_sm: Rc<RefCell<M>>,
    key_sm: Rc<RefCell<M>>,

    prefix: Name,
    kr_prefix: Name,
    mr_prefix: Name,

    new_key_cb: AddKeyCb,
    conn_cb: Option<ConnectedCb>,
    /// Whether a signing chain grants subscriber-group membership for this
    /// collection.
    sg_member: Box<dyn Fn(&Thumbprint) -> bool>,
    /// Keymaker priority lookup; set up once the role capability is known.
    km_pri: Option<PriorityCb>,

    tp: Thumbprint,
    /// Thumbprint of the keymaker we currently follow.
    kmtp: Thumbprint,
    /// Own signing key pair converted to X25519, for opening sealed boxes.
    p_dec_key: Option<PublicKey>,
    s_dec_key: Option<SecretKey>,
    /// Current group key pair; the secret half only exists at the keymaker.
    sg_pk: Option<PublicKey>,
    sg_sk: Option<SecretKey>,
    /// Creation time of the current group key in microseconds.
    cur_key_ct: u64,
    /// Enrolled members and their X25519 public keys, keymaker only.
    mbr_list: BTreeMap<Thumbprint, PublicKey>,

    rekey_interval: Duration,
    key_lifetime: Duration,
    max_records: usize,

    km_epoch: u32,
    key_maker: bool,
    subr: bool,
    init: bool,
    pub_dist: bool,
    mr_pending: bool,

    mr_refresh: Option<S::Timer>,
    election: Option<KmElection<S, M>>,

    rng: Rng,
}

impl<S, C, M> SgKeyDistributor<S, C, M>
where
    S: SyncCollection + 'static,
    C: CertStore + 'static,
    M: SigMgr + 'static,
{
    /// Creates a distributor for the collection reconciled by `sync`,
    /// publishing under `prefix`.
    ///
    /// Fails when the identity at the head of the signing chain is missing,
    /// malformed or does not convert to X25519.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync: Rc<S>,
        certs: Rc<C>,
        prefix: Name,
        sync_sigmgr: M,
        key_sigmgr: M,
        add_key_cb: impl Fn(&[u8], &[u8], u64) + 'static,
        config: Config,
        rng: Rng,
    ) -> Result<Self, DistributorError> {
        let key_coll = sync
            .collection_name()
            .last()
            .and_then(Component::as_str)
            .unwrap_or_default()
            .to_string();
        let pub_dist = key_coll == PUBS_COLLECTION;
        let kr_prefix = prefix.join(Component::str("kr"));
        let mr_prefix = prefix.join(Component::str("mr"));
        let cand_prefix = prefix
            .join(Component::str("km"))
            .join(Component::str("cand"));
        let key_lifetime = config.rekey_interval + config.rekey_randomize;

        sync.set_cstate_lifetime(CSTATE_LIFETIME);
        sync.set_pub_lifetime(key_lifetime + config.expiration_guard_band);
        {
            let mr_prefix = mr_prefix.clone();
            sync.set_lifetime_cb(Box::new(move |name| {
                if mr_prefix.is_prefix_of(name) {
                    MR_LIFETIME
                } else if cand_prefix.is_prefix_of(name) {
                    CANDIDACY_LIFETIME
                } else {
                    key_lifetime
                }
            }));
        }

        // The key-collection sigmgr authenticates every inbound publication
        // before any thumbprint out of it is trusted.
        let key_sm = Rc::new(RefCell::new(key_sigmgr));
        {
            let key_sm = key_sm.clone();
            sync.set_validate_cb(Box::new(move |p| key_sm.borrow().validate(p)));
        }

        let tp = *certs
            .chains()
            .first()
            .ok_or(DistributorError::NoSigningChain)?;
        let sg_member: Box<dyn Fn(&Thumbprint) -> bool> = {
            let certs = certs.clone();
            let collection = key_coll.into_bytes();
            Box::new(move |tp| capability_argument(&*certs, tp, SUBSCRIBER_GROUP) == collection)
        };

        let this = Rc::new(RefCell::new(Inner {
            sync: sync.clone(),
            certs: certs.clone(),
            sync_sm: Rc::new(RefCell::new(sync_sigmgr)),
            key_sm,
            prefix,
            kr_prefix,
            mr_prefix,
            new_key_cb: Rc::new(add_key_cb),
            conn_cb: None,
            sg_member,
            km_pri: None,
            tp,
            kmtp: [0; THUMBPRINT_SIZE],
            p_dec_key: None,
            s_dec_key: None,
            sg_pk: None,
            sg_sk: None,
            cur_key_ct: 0,
            mbr_list: BTreeMap::new(),
            rekey_interval: config.rekey_interval,
            key_lifetime,
            max_records: max_records_per_pub(config.max_pub_size),
            km_epoch: 0,
            key_maker: false,
            subr: false,
            init: true,
            pub_dist,
            mr_pending: false,
            mr_refresh: None,
            election: None,
            rng,
        }));

        let secret = certs.key(&tp).ok_or(DistributorError::MissingSigningKey)?;
        let cert = certs.get(&tp).ok_or(DistributorError::MissingCert)?;
        Inner::update_signing_key(&this, &secret, &cert)?;

        Ok(Self { inner: this })
    }

    /// Joins the collection: figures out the role capability, runs the
    /// keymaker election if eligible and starts listening for key records.
    ///
    /// `connected_cb` fires once, when this entity reaches operational
    /// state for its role.
    pub fn setup(&self, connected_cb: impl FnOnce(bool) + 'static) {
        let this = &self.inner;
        {
            let mut s = this.borrow_mut();
            s.conn_cb = Some(Box::new(connected_cb));

            // A relay carries encrypted publications without ever using the
            // group key; keep it out of the public-keys group entirely.
            if s.pub_dist {
                let relay = s
                    .certs
                    .get(&s.tp)
                    .is_some_and(|cert| cert.role() == Some("relay"));
                if relay {
                    let conn = s.complete_init();
                    drop(s);
                    if let Some(cb) = conn {
                        cb(true);
                    }
                    return;
                }
            }

            let cap = if s.pub_dist { KEYMAKER_PUBS } else { KEYMAKER };
            let priority_cb = |certs: Rc<C>| -> PriorityCb {
                Box::new(move |tp: &Thumbprint| keymaker_priority(&*certs, tp, cap))
            };
            let priority = priority_cb(s.certs.clone());
            s.km_pri = Some(priority_cb(s.certs.clone()));

            let eligible = s.subr && priority(&s.tp) > 0;
            if eligible {
                let weak = Rc::downgrade(this);
                let done: ElectionDoneCb = Box::new(move |elected, epoch| {
                    if let Some(this) = weak.upgrade() {
                        Inner::election_done(&this, elected, epoch);
                    }
                });
                let settle = if s.pub_dist {
                    PUBS_SETTLE_WINDOW
                } else {
                    SETTLE_WINDOW
                };
                let election = KmElection::start(
                    s.sync.clone(),
                    s.key_sm.clone(),
                    s.prefix.join(Component::str("km")),
                    priority,
                    s.tp,
                    settle,
                    done,
                );
                s.election = Some(election);
            } else {
                Inner::subscribe_key_records(this, &mut s);
            }
        }
    }

    /// Installs a rotated identity key pair: the new certificate must sit
    /// at the head of the signing chain and must not change this identity's
    /// subscriber or keymaker role. Both signature managers are reseated,
    /// the X25519 conversions recomputed, and an already-enrolled member
    /// re-requests membership so the keymaker re-seals towards the new
    /// thumbprint.
    pub fn update_signing_key(&self, secret: &[u8], cert: &Cert) -> Result<(), DistributorError> {
        Inner::update_signing_key(&self.inner, secret, cert)
    }

    /// Stops encrypting the group key towards `tp`. With `rekey` the group
    /// key is replaced immediately, leaving the periodic schedule alone.
    pub fn remove_group_member(&self, tp: &Thumbprint, rekey: bool) {
        self.inner.borrow_mut().mbr_list.remove(tp);
        if rekey {
            Inner::make_sg_key(&self.inner);
        }
    }

    pub fn thumbprint(&self) -> Thumbprint {
        self.inner.borrow().tp
    }

    pub fn is_keymaker(&self) -> bool {
        self.inner.borrow().key_maker
    }

    pub fn epoch(&self) -> u32 {
        self.inner.borrow().km_epoch
    }

    /// Creation time of the current group key, 0 before any key is known.
    pub fn current_key_ct(&self) -> u64 {
        self.inner.borrow().cur_key_ct
    }

    pub fn member_count(&self) -> usize {
        self.inner.borrow().mbr_list.len()
    }
}

impl<S, C, M> Inner<S, C, M>
where
    S: SyncCollection + 'static,
    C: CertStore + 'static,
    M: SigMgr + 'static,
{
    /// Leaves the init state; returns the connected callback for the caller
    /// to invoke once borrows are released.
    fn complete_init(&mut self) -> Option<ConnectedCb> {
        if self.init {
            self.init = false;
            self.conn_cb.take()
        } else {
            None
        }
    }

    fn kmpri(&self, tp: &Thumbprint) -> i32 {
        self.km_pri.as_ref().map(|priority| priority(tp)).unwrap_or(0)
    }

    fn subscribe_key_records(this: &Rc<RefCell<Self>>, s: &mut Self) {
        let weak = Rc::downgrade(this);
        let kr_prefix = s.kr_prefix.clone();
        s.sync.subscribe(
            kr_prefix,
            Box::new(move |p| {
                if let Some(this) = weak.upgrade() {
                    Inner::receive_key_records(&this, p);
                }
            }),
        );
    }

    /// Installs a new local signing key pair: reseats both signature
    /// managers, recomputes subscriber-group membership and the X25519
    /// conversions, and re-enrolls with the keymaker when already past
    /// initialization.
    ///
    /// A capability change across rotation is a schema violation and fatal.
    fn update_signing_key(
        this: &Rc<RefCell<Self>>,
        secret: &[u8],
        cert: &Cert,
    ) -> Result<(), DistributorError> {
        let republish = {
            let mut s = this.borrow_mut();
            let head = *s
                .certs
                .chains()
                .first()
                .ok_or(DistributorError::NoSigningChain)?;
            if cert.thumbprint() != head {
                return Err(DistributorError::CertMismatch);
            }
            s.tp = head;

            s.sync_sm.borrow_mut().update_signing_key(secret, cert)?;
            s.key_sm.borrow_mut().update_signing_key(secret, cert)?;
            let certs = s.certs.clone();
            s.sync_sm
                .borrow_mut()
                .set_key_cb(Box::new(move |p| certs.signing_key(p)));
            let certs = s.certs.clone();
            s.key_sm
                .borrow_mut()
                .set_key_cb(Box::new(move |p| certs.signing_key(p)));

            let is_member = (s.sg_member)(&s.tp);
            if s.subr && !is_member {
                return Err(DistributorError::SubscriberRoleChanged);
            }
            s.subr = is_member;
            if !s.subr {
                // Publish-only identity, nothing to convert.
                false
            } else {
                s.s_dec_key = Some(x25519::secret_key_from_ed25519(secret)?);
                s.p_dec_key = Some(x25519::public_key_from_ed25519(&cert.content)?);
                if s.init {
                    false
                } else if !s.key_maker {
                    // Keymaker must re-seal towards the new thumbprint.
                    true
                } else if s.kmpri(&s.tp) > 0 {
                    s.kmtp = s.tp;
                    false
                } else {
                    return Err(DistributorError::KeymakerRoleChanged);
                }
            }
        };
        if republish {
            Self::publish_membership_req(this);
        }
        Ok(())
    }

    /// Publishes a membership request and schedules its own refresh after
    /// one key lifetime. Receipt of a covering key record cancels the
    /// refresh.
    fn publish_membership_req(this: &Rc<RefCell<Self>>) {
        let mut s = this.borrow_mut();
        if let Some(timer) = s.mr_refresh.take() {
            timer.cancel();
        }
        if !s.subr {
            return;
        }
        let name = membership_request_name(&s.mr_prefix, s.sync.now());
        let mut request = Publication::new(name, Vec::new());
        if let Err(err) = s.key_sm.borrow().sign(&mut request) {
            warn!("cannot sign membership request: {err}");
            return;
        }
        s.mr_pending = true;
        s.sync.publish(request);

        let weak = Rc::downgrade(this);
        let refresh = s.sync.schedule(
            s.key_lifetime,
            Box::new(move || {
                if let Some(this) = weak.upgrade() {
                    Inner::publish_membership_req(&this);
                }
            }),
        );
        s.mr_refresh = Some(refresh);
    }

    /// A current group key arrived; the pending membership request is
    /// satisfied.
    fn received_gk(&mut self) {
        if let Some(timer) = self.mr_refresh.take() {
            timer.cancel();
        }
        self.mr_pending = false;
    }

    fn election_done(this: &Rc<RefCell<Self>>, elected: bool, epoch: u32) {
        {
            let mut s = this.borrow_mut();
            s.key_maker = elected;
            s.km_epoch = epoch;
            s.election = None;
            // Everybody watches the key records; for a winner that is how
            // concurrent keymakers get detected.
            Self::subscribe_key_records(this, &mut s);
            if elected {
                let weak = Rc::downgrade(this);
                let mr_prefix = s.mr_prefix.clone();
                s.sync.subscribe(
                    mr_prefix,
                    Box::new(move |p| {
                        if let Some(this) = weak.upgrade() {
                            Inner::add_group_member(&this, p);
                        }
                    }),
                );
            }
        }
        if elected {
            Self::sgkey_timeout(this);
        }
    }

    /// Handles a key-record publication: conflict resolution, epoch and
    /// freshness checks, then extraction of the group key for this peer's
    /// role.
    fn receive_key_records(this: &Rc<RefCell<Self>>, p: Publication) {
        let mut s = this.borrow_mut();

        // The key locator only attributes the publication once the
        // signature checks out against it.
        if !s.key_sm.borrow().validate(&p) {
            warn!("dropping key records with invalid signature");
            return;
        }
        let signer = *p.thumbprint();

        if s.kmpri(&signer) <= 0 {
            warn!(
                "ignoring key records signed by unauthorized identity {}",
                hex::encode(signer)
            );
            return;
        }

        if s.key_maker {
            // Another keymaker; the greater thumbprint keeps the role.
            if s.tp < signer {
                warn!(
                    "yielding keymaker role to {}; re-enrolling as member",
                    hex::encode(signer)
                );
                s.key_maker = false;
                s.kmtp = signer;
                let mr_prefix = s.mr_prefix.clone();
                s.sync.unsubscribe(&mr_prefix);
                drop(s);
                Self::publish_membership_req(this);
            }
            return;
        }

        if s.init && s.subr && !s.mr_pending {
            drop(s);
            Self::publish_membership_req(this);
            return;
        }

        let Ok(kr_name) = parse_key_record_name(p.name(), s.kr_prefix.len()) else {
            debug!("dropping key records with malformed name");
            return;
        };
        if kr_name.epoch != s.km_epoch {
            // Until re-elections exist there is exactly one legitimate
            // epoch to adopt.
            if kr_name.epoch != 1 {
                warn!("dropping key records with bad epoch {}", kr_name.epoch);
                return;
            }
            s.km_epoch = kr_name.epoch;
            s.kmtp = [0; THUMBPRINT_SIZE];
        }

        if s.kmtp < signer {
            // A keymaker with a greater thumbprint supersedes the one we
            // followed; reset freshness so its key is accepted even when
            // older than the current one.
            s.cur_key_ct = 0;
            s.kmtp = signer;
        }

        let Ok(content) = KeyRecordContent::decode(p.content()) else {
            debug!("dropping key records with malformed content");
            return;
        };

        if s.subr {
            let tp_id = &s.tp[..RANGE_ID_SIZE];
            if tp_id < &kr_name.range_low[..] || tp_id > &kr_name.range_high[..] {
                // This shard cannot contain our record. A fresh key we are
                // not covered by means the keymaker does not know us.
                if content.created_at > s.cur_key_ct && !s.mr_pending {
                    let weak = Rc::downgrade(this);
                    s.sync.one_time(
                        MR_NUDGE_DELAY,
                        Box::new(move || {
                            if let Some(this) = weak.upgrade() {
                                Inner::publish_membership_req(&this);
                            }
                        }),
                    );
                }
                return;
            }
        }

        if content.created_at <= s.cur_key_ct {
            return;
        }

        if !s.subr {
            s.cur_key_ct = content.created_at;
            let new_key_cb = s.new_key_cb.clone();
            let conn = s.complete_init();
            drop(s);
            (*new_key_cb)(content.group_key.as_bytes(), &[], content.created_at);
            if let Some(cb) = conn {
                cb(true);
            }
            return;
        }

        let Some(record) = content.records.iter().find(|record| record.holder == s.tp) else {
            return;
        };
        let (Some(dec_pk), Some(dec_sk)) = (&s.p_dec_key, &s.s_dec_key) else {
            return;
        };
        let Ok(group_secret) = sealed_box::open(&record.sealed, dec_pk, dec_sk) else {
            debug!("cannot open sealed group key record");
            return;
        };

        s.cur_key_ct = content.created_at;
        s.received_gk();
        let new_key_cb = s.new_key_cb.clone();
        let conn = s.complete_init();
        drop(s);
        (*new_key_cb)(
            content.group_key.as_bytes(),
            &group_secret,
            content.created_at,
        );
        if let Some(cb) = conn {
            cb(true);
        }
    }

    fn build_key_record(
        &self,
        low: &Thumbprint,
        high: &Thumbprint,
        timestamp: u64,
        content: Vec<u8>,
    ) -> Result<Publication, SigMgrError> {
        let name = key_record_name(&self.kr_prefix, self.km_epoch, low, high, timestamp);
        let mut p = Publication::new(name, content);
        self.key_sm.borrow().sign(&mut p)?;
        Ok(p)
    }

    /// Generates a new group key pair, hands it to the upper layer and
    /// publishes it, sealed towards every live member, in range-named
    /// shards.
    fn make_sg_key(this: &Rc<RefCell<Self>>) {
        let (new_key_cb, pk_bytes, sk_bytes, created_at, pubs, conn) = {
            let mut s = this.borrow_mut();
            let group_secret = match s.rng.random_array() {
                Ok(bytes) => SecretKey::from_bytes(bytes),
                Err(err) => {
                    error!("cannot generate group key: {err}");
                    return;
                }
            };
            let group_key = group_secret.public_key();
            let now = s.sync.now();
            s.cur_key_ct = now;

            // Members whose certs lapsed get no further keys.
            let certs = s.certs.clone();
            s.mbr_list.retain(|tp, _| {
                certs
                    .get(tp)
                    .is_some_and(|cert| cert.validity.not_after > now)
            });

            let mut sealed = Vec::with_capacity(s.mbr_list.len());
            for (tp, member_key) in &s.mbr_list {
                match sealed_box::seal(group_secret.as_bytes(), member_key, &s.rng) {
                    Ok(ciphertext) => sealed.push(EncryptedKeyRecord {
                        holder: *tp,
                        sealed: ciphertext,
                    }),
                    Err(err) => warn!("cannot seal group key for member: {err}"),
                }
            }

            let sk_bytes = Zeroizing::new(*group_secret.as_bytes());
            let pk_bytes = *group_key.as_bytes();
            s.sg_pk = Some(group_key);
            s.sg_sk = Some(group_secret);

            let mut pubs: Vec<(Publication, bool)> = Vec::new();
            if sealed.is_empty() {
                // No subscribers yet: an empty record list still asserts
                // the keymaker role and carries the public key to
                // publishers. Confirmation of this one completes init.
                let content = KeyRecordContent {
                    created_at: now,
                    group_key,
                    records: Vec::new(),
                };
                let own = s.tp;
                match s.build_key_record(&own, &own, now, content.encode()) {
                    Ok(p) => pubs.push((p, true)),
                    Err(err) => warn!("cannot sign key records: {err}"),
                }
            } else {
                for chunk in sealed.chunks(s.max_records) {
                    let content = KeyRecordContent {
                        created_at: now,
                        group_key,
                        records: chunk.to_vec(),
                    };
                    let low = chunk.first().expect("chunks are never empty").holder;
                    let high = chunk.last().expect("chunks are never empty").holder;
                    match s.build_key_record(&low, &high, now, content.encode()) {
                        Ok(p) => pubs.push((p, false)),
                        Err(err) => warn!("cannot sign key records: {err}"),
                    }
                }
            }

            let conn = if !s.mbr_list.is_empty() {
                s.complete_init()
            } else {
                None
            };
            (s.new_key_cb.clone(), pk_bytes, sk_bytes, now, pubs, conn)
        };

        // The keymaker starts using the key before any delivery confirms.
        (*new_key_cb)(&pk_bytes, &sk_bytes[..], created_at);

        let sync = this.borrow().sync.clone();
        for (p, confirm) in pubs {
            if confirm {
                let weak = Rc::downgrade(this);
                sync.publish_confirm(
                    p,
                    Box::new(move |_name, delivered| {
                        if delivered {
                            if let Some(this) = weak.upgrade() {
                                Inner::init_confirmed(&this);
                            }
                        }
                    }),
                );
            } else {
                sync.publish(p);
            }
        }

        if let Some(cb) = conn {
            cb(true);
        }
    }

    fn init_confirmed(this: &Rc<RefCell<Self>>) {
        let conn = this.borrow_mut().complete_init();
        if let Some(cb) = conn {
            cb(true);
        }
    }

    /// Periodic rekey driver. Not cancellable; it gates itself on the
    /// keymaker flag so a lost role stops the cycle.
    fn sgkey_timeout(this: &Rc<RefCell<Self>>) {
        {
            let s = this.borrow();
            if !s.key_maker {
                return;
            }
            let now = s.sync.now();
            let valid = s
                .certs
                .get(&s.tp)
                .is_some_and(|cert| cert.validity.not_after > now);
            if !valid {
                // The upper layer must reissue the identity before this.
                error!("own signing cert expired; halting rekey cycle");
                return;
            }
        }
        Self::make_sg_key(this);

        let (sync, interval) = {
            let s = this.borrow();
            (s.sync.clone(), s.rekey_interval)
        };
        let weak = Rc::downgrade(this);
        sync.one_time(
            interval,
            Box::new(move || {
                if let Some(this) = weak.upgrade() {
                    Inner::sgkey_timeout(&this);
                }
            }),
        );
    }

    /// Handles a membership request: validates the requester's subscriber
    /// capability and certificate, enrolls it and, when a group key already
    /// exists, publishes a single-recipient key record so the member does
    /// not wait for the next bulk rekey.
    fn add_group_member(this: &Rc<RefCell<Self>>, p: Publication) {
        let (publication, conn) = {
            let mut s = this.borrow_mut();
            if !s.key_maker {
                return;
            }
            if s.mbr_list.len() >= MEMBER_LIMIT_FACTOR * s.max_records {
                warn!("member list is full; ignoring membership request");
                return;
            }
            if !s.key_sm.borrow().validate(&p) {
                debug!("dropping membership request with invalid signature");
                return;
            }
            let tp = *p.thumbprint();
            if !(s.sg_member)(&tp) {
                debug!("membership request without subscriber capability");
                return;
            }
            let Some(cert) = s.certs.get(&tp) else {
                return;
            };
            if s.pub_dist && cert.role() == Some("relay") {
                return;
            }
            let now = s.sync.now();
            if !cert.validity.covers(now) {
                debug!("membership request with expired cert");
                return;
            }
            let Ok(member_key) = x25519::public_key_from_ed25519(&cert.content) else {
                debug!("cannot convert member signing key");
                s.mbr_list.remove(&tp);
                return;
            };
            s.mbr_list.insert(tp, member_key);

            if s.cur_key_ct == 0 {
                // No group key yet; the first one covers this member.
                return;
            }
            let Some(group_secret) = s.sg_sk.as_ref() else {
                return;
            };
            let Some(group_key) = s.sg_pk else {
                return;
            };
            let sealed = match sealed_box::seal(group_secret.as_bytes(), &member_key, &s.rng) {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    warn!("cannot seal group key for new member: {err}");
                    return;
                }
            };
            let content = KeyRecordContent {
                created_at: s.cur_key_ct,
                group_key,
                records: vec![EncryptedKeyRecord {
                    holder: tp,
                    sealed,
                }],
            };
            let publication = match s.build_key_record(&tp, &tp, now, content.encode()) {
                Ok(p) => p,
                Err(err) => {
                    warn!("cannot sign key records: {err}");
                    return;
                }
            };
            let conn = s.complete_init();
            (publication, conn)
        };

        this.borrow().sync.publish(publication);
        if let Some(cb) = conn {
            cb(true);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("certstore holds no signing chain")]
    NoSigningChain,

    #[error("signing cert is missing from the certstore")]
    MissingCert,

    #[error("secret signing key is missing from the certstore")]
    MissingSigningKey,

    #[error("new signing cert is not at the head of the signing chain")]
    CertMismatch,

    #[error("subscriber capability changed across key rotation")]
    SubscriberRoleChanged,

    #[error("keymaker capability changed across key rotation")]
    KeymakerRoleChanged,

    #[error(transparent)]
    KeyConversion(#[from] x25519::X25519Error),

    #[error(transparent)]
    SigMgr(#[from] SigMgrError),
}
