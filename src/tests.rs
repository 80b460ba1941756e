// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-peer distribution scenarios on the simulated collection.
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::capability::{KEYMAKER, KEYMAKER_PUBS, SUBSCRIBER_GROUP};
use crate::cert::{Capability, Cert, Thumbprint, Validity};
use crate::crypto::Rng;
use crate::distributor::{Config, SgKeyDistributor};
use crate::name::Name;
use crate::publication::Publication;
use crate::records::{KeyRecordContent, KeyRecordName, parse_key_record_name};
use crate::test_utils::{EdSigMgr, START_TIME, SimCertStore, SimDomain, SimIdentity, SimNet, SimSync};
use crate::traits::{SigMgr, SyncCollection};

const FOREVER: Validity = Validity {
    not_before: 0,
    not_after: u64::MAX,
};

fn sg(collection: &str) -> Capability {
    Capability::new(SUBSCRIBER_GROUP, collection)
}

fn km(priority: &str) -> Capability {
    Capability::new(KEYMAKER, priority)
}

fn kmp(priority: &str) -> Capability {
    Capability::new(KEYMAKER_PUBS, priority)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KeyEvent {
    public: Vec<u8>,
    secret: Vec<u8>,
    created_at: u64,
}

struct Peer {
    dist: SgKeyDistributor<SimSync, SimCertStore, EdSigMgr>,
    sync: Rc<SimSync>,
    tp: Thumbprint,
    cert: Cert,
    secret: Vec<u8>,
    keys: Rc<RefCell<Vec<KeyEvent>>>,
    connected: Rc<Cell<bool>>,
}

impl Peer {
    fn spawn(
        net: &SimNet,
        domain: &SimDomain,
        prefix: &Name,
        id: &str,
        caps: &[Capability],
        config: Config,
        seed: u8,
    ) -> Self {
        let identity = domain.identity("operator", id, caps, FOREVER);
        Self::from_identity(net, identity, prefix, config, seed)
    }

    fn from_identity(
        net: &SimNet,
        identity: SimIdentity,
        prefix: &Name,
        config: Config,
        seed: u8,
    ) -> Self {
        let sync = net.join();
        let keys = Rc::new(RefCell::new(Vec::new()));
        let sink = keys.clone();
        let dist = SgKeyDistributor::new(
            sync.clone(),
            identity.certstore(),
            prefix.clone(),
            EdSigMgr::new(),
            EdSigMgr::new(),
            move |public: &[u8], secret: &[u8], created_at| {
                sink.borrow_mut().push(KeyEvent {
                    public: public.to_vec(),
                    secret: secret.to_vec(),
                    created_at,
                });
            },
            config,
            Rng::from_seed([seed; 32]),
        )
        .expect("distributor construction succeeds");
        Self {
            dist,
            sync,
            tp: identity.tp,
            cert: identity.cert,
            secret: identity.signing_secret,
            keys,
            connected: Rc::new(Cell::new(false)),
        }
    }

    fn setup(&self) {
        let connected = self.connected.clone();
        self.dist.setup(move |ok| connected.set(ok));
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn key_count(&self) -> usize {
        self.keys.borrow().len()
    }

    fn last_key(&self) -> KeyEvent {
        self.keys
            .borrow()
            .last()
            .cloned()
            .expect("peer received a key")
    }
}

fn pdu_prefix() -> Name {
    Name::from_str_parts(&["dctest", "keys", "pdus"])
}

fn pubs_prefix() -> Name {
    Name::from_str_parts(&["dctest", "keys", "pubs"])
}

fn key_records(net: &SimNet, prefix: &Name) -> Vec<(KeyRecordName, KeyRecordContent)> {
    let kr_prefix = prefix.join(crate::name::Component::str("kr"));
    net.published()
        .iter()
        .filter(|p| kr_prefix.is_prefix_of(p.name()))
        .map(|p| {
            (
                parse_key_record_name(p.name(), kr_prefix.len()).expect("key record name parses"),
                KeyRecordContent::decode(p.content()).expect("key record content parses"),
            )
        })
        .collect()
}

fn membership_requests(net: &SimNet, prefix: &Name) -> Vec<Publication> {
    let mr_prefix = prefix.join(crate::name::Component::str("mr"));
    net.published()
        .into_iter()
        .filter(|p| mr_prefix.is_prefix_of(p.name()))
        .collect()
}

#[test]
fn solo_keymaker_reaches_ready() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [1; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    alice.setup();
    net.advance(Duration::from_secs(1));

    assert!(alice.is_connected());
    assert!(alice.dist.is_keymaker());
    assert_eq!(alice.dist.epoch(), 1);

    // Exactly one key, with a secret half, delivered once.
    assert_eq!(alice.key_count(), 1);
    let key = alice.last_key();
    assert_eq!(key.public.len(), 32);
    assert_eq!(key.secret.len(), 32);
    assert_eq!(key.created_at, alice.dist.current_key_ct());

    // The empty key record uses our own thumbprint for both range bounds.
    let records = key_records(&net, &prefix);
    assert_eq!(records.len(), 1);
    let (name, content) = &records[0];
    assert_eq!(name.epoch, 1);
    assert_eq!(name.range_low, alice.tp[..4]);
    assert_eq!(name.range_high, alice.tp[..4]);
    assert!(content.records.is_empty());
}

#[test]
fn subscriber_enrolls_and_decrypts() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [2; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));

    assert!(alice.dist.is_keymaker());
    assert!(!bob.dist.is_keymaker());
    assert!(alice.is_connected());
    assert!(bob.is_connected());

    // Bob enrolled and got a single-recipient record.
    assert_eq!(alice.dist.member_count(), 1);
    assert!(!membership_requests(&net, &prefix).is_empty());
    let single: Vec<_> = key_records(&net, &prefix)
        .into_iter()
        .filter(|(name, _)| name.range_low == bob.tp[..4] && name.range_high == bob.tp[..4])
        .collect();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].1.records.len(), 1);
    assert_eq!(single[0].1.records[0].holder, bob.tp);

    // Same epoch, same creation time, same key pair on both sides.
    assert_eq!(bob.dist.epoch(), 1);
    assert_eq!(alice.dist.current_key_ct(), bob.dist.current_key_ct());
    assert_eq!(alice.last_key(), bob.last_key());
    assert_eq!(bob.last_key().secret.len(), 32);
}

#[test]
fn publish_only_peer_gets_public_key_without_enrolling() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [3; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let carol = Peer::spawn(&net, &domain, &prefix, "carol", &[], Config::default(), 12);
    alice.setup();
    carol.setup();
    net.advance(Duration::from_secs(2));

    assert!(carol.is_connected());
    assert_eq!(carol.dist.current_key_ct(), alice.dist.current_key_ct());

    // Public key only, no secret half, no membership request.
    let key = carol.last_key();
    assert_eq!(key.public, alice.last_key().public);
    assert!(key.secret.is_empty());
    assert!(
        membership_requests(&net, &prefix)
            .iter()
            .all(|p| p.thumbprint() != &carol.tp)
    );
    assert_eq!(alice.dist.member_count(), 0);
}

#[test]
fn concurrent_keymakers_converge_on_greater_thumbprint() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [4; 32]);

    let id_1 = domain.identity("operator", "peer-1", &[sg("pdus"), km("1")], FOREVER);
    let id_2 = domain.identity("operator", "peer-2", &[sg("pdus"), km("1")], FOREVER);
    let (winner_id, loser_id) = if id_1.tp > id_2.tp {
        (id_1, id_2)
    } else {
        (id_2, id_1)
    };

    let loser = Peer::from_identity(&net, loser_id, &prefix, Config::default(), 10);
    let winner = Peer::from_identity(&net, winner_id, &prefix, Config::default(), 11);

    // Partitioned start: both win their own election and publish key
    // records at epoch 1. The later boot gives the winner the fresher key.
    net.partition(&loser.sync, &winner.sync);
    loser.setup();
    net.advance(Duration::from_millis(10));
    winner.setup();
    net.advance(Duration::from_secs(2));

    assert!(loser.dist.is_keymaker());
    assert!(winner.dist.is_keymaker());
    assert_ne!(loser.dist.current_key_ct(), winner.dist.current_key_ct());

    net.heal(&loser.sync, &winner.sync);
    net.advance(Duration::from_secs(3));

    // The smaller thumbprint relinquished and re-enrolled as a member.
    assert!(!loser.dist.is_keymaker());
    assert!(winner.dist.is_keymaker());
    assert!(
        membership_requests(&net, &prefix)
            .iter()
            .any(|p| p.thumbprint() == &loser.tp)
    );
    assert_eq!(winner.dist.member_count(), 1);
    assert_eq!(loser.dist.current_key_ct(), winner.dist.current_key_ct());
    assert_eq!(loser.last_key(), winner.last_key());
}

#[test]
fn rekey_purges_expired_member() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [5; 32]);
    let config = Config {
        rekey_interval: Duration::from_secs(10),
        rekey_randomize: Duration::from_secs(0),
        ..Config::default()
    };

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        config.clone(),
        10,
    );
    let short_lived = domain.identity(
        "operator",
        "xavier",
        &[sg("pdus")],
        Validity {
            not_before: 0,
            not_after: START_TIME + 5_000_000,
        },
    );
    let xavier = Peer::from_identity(&net, short_lived, &prefix, config, 11);

    alice.setup();
    xavier.setup();
    net.advance(Duration::from_secs(2));
    assert_eq!(alice.dist.member_count(), 1);
    assert!(xavier.is_connected());
    let enrolled_ct = xavier.dist.current_key_ct();

    // The rekey fires past xavier's expiry; his record disappears and the
    // nudged membership request is rejected against the lapsed cert.
    net.advance(Duration::from_secs(11));
    assert_eq!(alice.dist.member_count(), 0);
    let records = key_records(&net, &prefix);
    let latest_ts = records
        .iter()
        .map(|(name, _)| name.timestamp)
        .max()
        .unwrap();
    let latest: Vec<_> = records
        .iter()
        .filter(|(name, _)| name.timestamp == latest_ts)
        .collect();
    assert_eq!(latest.len(), 1);
    assert!(latest[0].1.records.is_empty());

    assert!(alice.dist.current_key_ct() > enrolled_ct);
    assert_eq!(xavier.dist.current_key_ct(), enrolled_ct);
}

#[test]
fn bulk_rekey_shards_are_contiguous_and_cover_all_members() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [6; 32]);
    let config = Config {
        rekey_interval: Duration::from_secs(30),
        rekey_randomize: Duration::from_secs(0),
        max_pub_size: 1024,
        ..Config::default()
    };

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        config.clone(),
        10,
    );
    let members: Vec<Peer> = (0..20)
        .map(|i| {
            Peer::spawn(
                &net,
                &domain,
                &prefix,
                &format!("sub-{i:02}"),
                &[sg("pdus")],
                config.clone(),
                20 + i as u8,
            )
        })
        .collect();

    alice.setup();
    for member in &members {
        member.setup();
    }
    net.advance(Duration::from_secs(5));
    assert_eq!(alice.dist.member_count(), 20);

    // Past the rekey interval every member gets re-sealed in bulk shards.
    net.advance(Duration::from_secs(30));

    let records = key_records(&net, &prefix);
    // The bulk shards share one timestamp; single-recipient records from
    // re-enrollment nudges can trail them.
    let bulk_ts = records
        .iter()
        .filter(|(_, content)| content.records.len() > 1)
        .map(|(name, _)| name.timestamp)
        .max()
        .unwrap();
    let mut shards: Vec<_> = records
        .into_iter()
        .filter(|(name, _)| name.timestamp == bulk_ts)
        .collect();
    shards.sort_by_key(|(name, _)| name.range_low);

    // 20 members at 7 records per publication.
    assert_eq!(shards.len(), 3);
    let sizes: Vec<_> = shards
        .iter()
        .map(|(_, content)| content.records.len())
        .collect();
    assert_eq!(sizes, vec![7, 7, 6]);

    for (name, content) in &shards {
        assert!(name.range_low <= name.range_high);
        for record in &content.records {
            assert!(record.holder[..4] >= name.range_low[..]);
            assert!(record.holder[..4] <= name.range_high[..]);
        }
    }
    for window in shards.windows(2) {
        assert!(window[0].0.range_high < window[1].0.range_low);
    }

    let mut sealed_for: Vec<Thumbprint> = shards
        .iter()
        .flat_map(|(_, content)| content.records.iter().map(|record| record.holder))
        .collect();
    sealed_for.sort();
    let mut expected: Vec<Thumbprint> = members.iter().map(|member| member.tp).collect();
    expected.sort();
    assert_eq!(sealed_for, expected);

    // Everybody converged on the new key.
    for member in &members {
        assert_eq!(member.dist.current_key_ct(), alice.dist.current_key_ct());
        assert_eq!(member.last_key(), alice.last_key());
    }
}

#[test]
fn removing_a_member_rekeys_immediately() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [12; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));
    assert_eq!(alice.dist.member_count(), 1);
    let old_ct = bob.dist.current_key_ct();

    alice.dist.remove_group_member(&bob.tp, true);
    net.advance(Duration::from_secs(1));
    assert_eq!(alice.dist.member_count(), 0);
    assert!(alice.dist.current_key_ct() > old_ct);
    assert_eq!(bob.dist.current_key_ct(), old_ct);

    // Bob's capability is still schema-valid, so the nudged membership
    // request re-enrolls him under the replacement key; shutting a member
    // out for good is the job of certificate expiry.
    net.advance(Duration::from_secs(4));
    assert_eq!(alice.dist.member_count(), 1);
    assert_eq!(bob.dist.current_key_ct(), alice.dist.current_key_ct());
}

#[test]
fn higher_priority_wins_election() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [7; 32]);

    let high = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "high",
        &[sg("pdus"), km("9")],
        Config::default(),
        10,
    );
    let low = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "low",
        &[sg("pdus"), km("1")],
        Config::default(),
        11,
    );
    high.setup();
    low.setup();
    net.advance(Duration::from_secs(2));

    assert!(high.dist.is_keymaker());
    assert!(!low.dist.is_keymaker());
    // The loser enrolled like any other subscriber.
    assert_eq!(high.dist.member_count(), 1);
    assert_eq!(high.last_key(), low.last_key());
}

#[test]
fn unauthorized_key_records_are_ignored() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [8; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));
    let settled = bob.dist.current_key_ct();

    // Eve holds SG but no keymaker capability; her forged records must not
    // move anybody's key state.
    let eve = domain.identity("operator", "eve", &[sg("pdus")], FOREVER);
    let eve_sync = net.join();
    let mut eve_sigmgr = EdSigMgr::new();
    eve_sigmgr
        .update_signing_key(&eve.signing_secret, &eve.cert)
        .unwrap();
    let forged_content = KeyRecordContent {
        created_at: net.now() + 1_000_000,
        group_key: crate::crypto::x25519::PublicKey::from_bytes([9; 32]),
        records: Vec::new(),
    };
    let name = crate::records::key_record_name(
        &prefix.join(crate::name::Component::str("kr")),
        1,
        &[0; 32],
        &[0xff; 32],
        net.now(),
    );
    let mut forged = Publication::new(name, forged_content.encode());
    eve_sigmgr.sign(&mut forged).unwrap();
    eve_sync.publish(forged);
    net.advance(Duration::from_secs(1));

    assert_eq!(bob.dist.current_key_ct(), settled);
    assert_eq!(alice.dist.current_key_ct(), settled);
    assert!(alice.dist.is_keymaker());
}

#[test]
fn forged_signatures_never_reach_the_distributor() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [13; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));
    let settled = bob.dist.current_key_ct();
    assert_eq!(alice.dist.member_count(), 1);

    // A key record stamped with alice's thumbprint but carrying a garbage
    // signature must die at the signature check, not at the capability
    // check the stolen locator would pass.
    let injector = net.join();
    let content = KeyRecordContent {
        created_at: net.now() + 1_000_000,
        group_key: crate::crypto::x25519::PublicKey::from_bytes([9; 32]),
        records: Vec::new(),
    };
    let name = crate::records::key_record_name(
        &prefix.join(crate::name::Component::str("kr")),
        1,
        &[0; 32],
        &[0xff; 32],
        net.now(),
    );
    let mut forged = Publication::new(name, content.encode());
    forged.set_signature(alice.tp, vec![0; 64]);
    injector.publish(forged);

    // Same for a membership request claiming a subscriber-capable identity.
    let dave = domain.identity("operator", "dave", &[sg("pdus")], FOREVER);
    let mr_name = crate::records::membership_request_name(
        &prefix.join(crate::name::Component::str("mr")),
        net.now(),
    );
    let mut forged_mr = Publication::new(mr_name, Vec::new());
    forged_mr.set_signature(dave.tp, vec![1; 64]);
    injector.publish(forged_mr);

    net.advance(Duration::from_secs(1));
    assert_eq!(bob.dist.current_key_ct(), settled);
    assert_eq!(alice.dist.current_key_ct(), settled);
    assert!(alice.dist.is_keymaker());
    assert_eq!(alice.dist.member_count(), 1);
}

#[test]
fn key_records_with_unknown_epoch_are_dropped() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [9; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));
    let settled = bob.dist.current_key_ct();

    // Authorized signer, but an epoch nobody can adopt yet.
    let injector = net.join();
    let mut sigmgr = EdSigMgr::new();
    sigmgr
        .update_signing_key(&alice.secret, &alice.cert)
        .unwrap();
    let content = KeyRecordContent {
        created_at: net.now() + 1_000_000,
        group_key: crate::crypto::x25519::PublicKey::from_bytes([9; 32]),
        records: Vec::new(),
    };
    let name = crate::records::key_record_name(
        &prefix.join(crate::name::Component::str("kr")),
        2,
        &[0; 32],
        &[0xff; 32],
        net.now(),
    );
    let mut p = Publication::new(name, content.encode());
    sigmgr.sign(&mut p).unwrap();
    injector.publish(p);
    net.advance(Duration::from_secs(1));

    assert_eq!(bob.dist.current_key_ct(), settled);
    assert_eq!(bob.dist.epoch(), 1);
}

#[test]
fn relay_is_exempt_from_the_public_keys_group() {
    let prefix = pubs_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [10; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pubs"), kmp("1")],
        Config::default(),
        10,
    );
    let relay_id = domain.identity("relay", "relay-1", &[sg("pubs")], FOREVER);
    let relay = Peer::from_identity(&net, relay_id, &prefix, Config::default(), 11);

    alice.setup();
    relay.setup();

    // Relays complete init immediately without joining the group.
    assert!(relay.is_connected());

    // The public-keys election settles after its longer window.
    net.advance(Duration::from_secs(6));
    assert!(alice.dist.is_keymaker());
    assert!(
        membership_requests(&net, &prefix)
            .iter()
            .all(|p| p.thumbprint() != &relay.tp)
    );
    assert_eq!(alice.dist.member_count(), 0);
    assert_eq!(relay.key_count(), 0);
}

#[test]
fn signing_key_rotation_requires_matching_cert() {
    let prefix = pdu_prefix();
    let net = SimNet::new(prefix.clone());
    let domain = SimDomain::new("dctest", [11; 32]);

    let alice = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "alice",
        &[sg("pdus"), km("1")],
        Config::default(),
        10,
    );
    let bob = Peer::spawn(
        &net,
        &domain,
        &prefix,
        "bob",
        &[sg("pdus")],
        Config::default(),
        11,
    );
    alice.setup();
    bob.setup();
    net.advance(Duration::from_secs(2));

    // Reinstalling the current key is fine and re-enrolls the member.
    let before = membership_requests(&net, &prefix).len();
    bob.dist.update_signing_key(&bob.secret, &bob.cert).unwrap();
    net.advance(Duration::from_secs(1));
    assert!(membership_requests(&net, &prefix).len() > before);

    // A cert that is not at the head of our signing chain is fatal.
    assert!(bob.dist.update_signing_key(&alice.secret, &alice.cert).is_err());
}
