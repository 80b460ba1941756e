// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keymaker election.
//!
//! Every eligible entity announces its candidacy under
//! `<prefix>/km/cand/<priority>/<thumbprint>/<timestamp>` and watches the
//! announcements of others. Candidacies are short-lived and re-announced
//! while the election is open. After a settling window the candidate
//! considers itself elected exactly when it has observed no candidate with a
//! strictly greater `(priority, thumbprint)` tuple; thumbprints are unique,
//! so ties cannot occur. The winner's first key record doubles as the
//! election announcement towards non-candidates.
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cert::Thumbprint;
use crate::name::{Component, Name};
use crate::publication::Publication;
use crate::traits::{SigMgr, SyncCollection};

/// Invoked exactly once when the election settles, with whether this entity
/// won and the epoch its reign would start at.
pub type ElectionDoneCb = Box<dyn FnOnce(bool, u32)>;

/// Priority lookup for a signing chain; 0 or less means "not eligible".
pub type PriorityCb = Box<dyn Fn(&Thumbprint) -> i32>;

/// Candidacies are re-announced at this interval; their publication
/// lifetime is about one second.
const REANNOUNCE_INTERVAL: Duration = Duration::from_millis(750);

/// A single keymaker election round. Dropping the handle abandons the
/// election; no callback fires afterwards.
pub struct KmElection<S: SyncCollection + 'static, M: SigMgr + 'static> {
    _state: Rc<RefCell<ElectionState<S, M>>>,
}

struct ElectionState<S: SyncCollection, M: SigMgr> {
    sync: Rc<S>,
    sigmgr: Rc<RefCell<M>>,
    cand_prefix: Name,
    own_tp: Thumbprint,
    own_priority: i32,
    priority: PriorityCb,
    /// Greatest `(priority, thumbprint)` observed so far, ours included.
    best: (i32, Thumbprint),
    done: Option<ElectionDoneCb>,
    decided: bool,
}

impl<S: SyncCollection + 'static, M: SigMgr + 'static> KmElection<S, M> {
    /// Starts an election round under `km_prefix` and settles it after
    /// `settle`.
    pub fn start(
        sync: Rc<S>,
        sigmgr: Rc<RefCell<M>>,
        km_prefix: Name,
        priority: PriorityCb,
        own_tp: Thumbprint,
        settle: Duration,
        done: ElectionDoneCb,
    ) -> Self {
        let own_priority = priority(&own_tp);
        let cand_prefix = km_prefix.join(Component::str("cand"));
        let state = Rc::new(RefCell::new(ElectionState {
            sync: sync.clone(),
            sigmgr,
            cand_prefix: cand_prefix.clone(),
            own_tp,
            own_priority,
            priority,
            best: (own_priority, own_tp),
            done: Some(done),
            decided: false,
        }));

        let weak = Rc::downgrade(&state);
        sync.subscribe(
            cand_prefix,
            Box::new(move |p| {
                if let Some(state) = weak.upgrade() {
                    ElectionState::on_candidate(&state, p);
                }
            }),
        );

        ElectionState::announce(&state);

        let weak = Rc::downgrade(&state);
        sync.one_time(
            settle,
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    ElectionState::settle(&state);
                }
            }),
        );

        Self { _state: state }
    }
}

impl<S: SyncCollection + 'static, M: SigMgr + 'static> ElectionState<S, M> {
    fn announce(this: &Rc<RefCell<Self>>) {
        let state = this.borrow();
        if state.decided {
            return;
        }
        let name = state
            .cand_prefix
            .join(Component::number(state.own_priority as u64))
            .join(Component::bytes(state.own_tp.to_vec()))
            .join(Component::timestamp(state.sync.now()));
        let mut candidacy = Publication::new(name, Vec::new());
        if let Err(err) = state.sigmgr.borrow().sign(&mut candidacy) {
            warn!("cannot sign candidacy: {err}");
            return;
        }
        state.sync.publish(candidacy);

        let weak = Rc::downgrade(this);
        state.sync.one_time(
            REANNOUNCE_INTERVAL,
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    Self::announce(&state);
                }
            }),
        );
    }

    fn on_candidate(this: &Rc<RefCell<Self>>, candidacy: Publication) {
        let mut state = this.borrow_mut();
        if state.decided {
            return;
        }
        if !state.sigmgr.borrow().validate(&candidacy) {
            debug!("ignoring candidacy with invalid signature");
            return;
        }
        // <cand prefix>/<priority>/<thumbprint>/<timestamp>
        let Some(tp_component) = candidacy.name().get(state.cand_prefix.len() + 1) else {
            return;
        };
        let Ok(tp) = <&Thumbprint>::try_from(tp_component.as_bytes()) else {
            return;
        };
        // The claimed thumbprint must be the one the signature attributes.
        if tp != candidacy.thumbprint() {
            return;
        }
        if *tp == state.own_tp {
            return;
        }
        // Rank by the schema's priority for the signing chain, not by the
        // value claimed in the name.
        let priority = (state.priority)(tp);
        if priority <= 0 {
            debug!("ignoring candidacy from ineligible identity");
            return;
        }
        if (priority, *tp) > state.best {
            state.best = (priority, *tp);
        }
    }

    fn settle(this: &Rc<RefCell<Self>>) {
        let mut state = this.borrow_mut();
        if state.decided {
            return;
        }
        state.decided = true;
        let elected = state.best.1 == state.own_tp;
        let prefix = state.cand_prefix.clone();
        state.sync.unsubscribe(&prefix);
        let done = state.done.take();
        drop(state);
        if let Some(done) = done {
            done(elected, 1);
        }
    }
}
