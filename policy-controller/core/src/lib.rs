#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The identity data model shared by the policy selector crates: label sets, label
//! selectors, FQDN selectors, and numeric identity snapshots.

mod fqdn;
mod identity;
pub mod labels;

pub use self::{
    fqdn::{FqdnSelector, IdentityNotifier},
    identity::{Identity, NumericIdentity},
    labels::{Labels, Selector},
};
