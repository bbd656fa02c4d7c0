//! A lock-free concurrent ordered set based on a skip list.
//!
//! The set supports non-blocking `insert`, `remove`, `contains`, and
//! `is_empty` from any number of threads. Removal is done in two steps:
//! a node is first marked as deleted at every level of its tower (logical
//! deletion), and later searches splice marked nodes out of the list
//! (physical deletion). Memory is reclaimed through `crossbeam-epoch` once
//! a node is unlinked at every level and all pinned threads have moved on.
//!
//! Iteration is deliberately not exposed; membership queries are the whole
//! contract.

mod base;
pub mod set;

pub use crate::set::SkipSet;
