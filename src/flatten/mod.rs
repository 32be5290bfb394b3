//! Flattening combinators.
//!
//! A [`FlatteningCombinator`] reads keys from a hot stream, asks an
//! [`InnerStreamFactory`] for the inner sequence of each key, and
//! re-linearizes the inner values into one [`Observer`](crate::observer::Observer)
//! according to its [`FlattenStrategy`].

/// The outer loop.
pub mod combinator;
/// Inner sequence contract.
pub mod inner;
/// Concat, merge and latest.
pub mod strategy;

pub use combinator::FlatteningCombinator;
pub use inner::{paced_sequence, InnerSequence, InnerStreamFactory};
pub use strategy::{Concat, FlattenContext, FlattenKind, FlattenStrategy, Latest, Merge, MergeConfig};
