// SPDX-License-Identifier: MIT OR Apache-2.0

mod certstore;
mod sigmgr;
mod sync;

pub use certstore::CertStore;
pub use sigmgr::{KeyLookupCb, SigMgr, SigMgrError};
pub use sync::{
    ConfirmCb, LifetimeCb, SubscribeCb, SyncCollection, TimerCb, TimerHandle, ValidateCb,
};
