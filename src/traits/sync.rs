// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use crate::name::Name;
use crate::publication::Publication;

pub type SubscribeCb = Box<dyn FnMut(Publication)>;

pub type TimerCb = Box<dyn FnOnce()>;

/// Invoked once with the publication name and whether delivery to the
/// collection was confirmed.
pub type ConfirmCb = Box<dyn FnOnce(Name, bool)>;

/// Maps a publication name to the lifetime it should stay alive in the
/// collection.
pub type LifetimeCb = Box<dyn Fn(&Name) -> Duration>;

/// Checks an inbound publication's signature against its key locator.
pub type ValidateCb = Box<dyn Fn(&Publication) -> bool>;

/// Cancellable handle for a scheduled timer.
pub trait TimerHandle {
    fn cancel(&self);
}

/// The set-reconciliation pub/sub collection the distributor rides on.
///
/// The model is single-threaded and cooperative. Implementations MUST NOT
/// invoke subscription, confirmation or timer callbacks synchronously from
/// inside `publish`, `subscribe` or `schedule`; deliveries happen on later
/// turns of the owning executor. Registered callbacks may be dropped without
/// firing when the registering side goes away.
pub trait SyncCollection {
    type Timer: TimerHandle;

    /// Name of the collection this instance reconciles.
    fn collection_name(&self) -> &Name;

    /// Current time in microseconds since the Unix epoch. Timers and all
    /// protocol timestamps derive from this clock.
    fn now(&self) -> u64;

    fn publish(&self, publication: Publication);

    /// Publish with a delivery confirmation callback.
    fn publish_confirm(&self, publication: Publication, confirm: ConfirmCb);

    /// Deliver every publication whose name starts with `prefix` to `cb`,
    /// including publications still alive at subscription time.
    fn subscribe(&self, prefix: Name, cb: SubscribeCb);

    fn unsubscribe(&self, prefix: &Name);

    /// Run `cb` once after `delay`. Not cancellable.
    fn one_time(&self, delay: Duration, cb: TimerCb);

    /// Run `cb` once after `delay`; the returned handle cancels it.
    fn schedule(&self, delay: Duration, cb: TimerCb) -> Self::Timer;

    fn set_cstate_lifetime(&self, lifetime: Duration);

    fn set_pub_lifetime(&self, lifetime: Duration);

    fn set_lifetime_cb(&self, cb: LifetimeCb);

    /// Installs the validator for inbound publications. A publication that
    /// fails validation is discarded before it reaches any subscription
    /// callback of this instance.
    fn set_validate_cb(&self, cb: ValidateCb);
}
