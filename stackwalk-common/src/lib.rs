//! This crate defines [the raw register context layouts](format/index.html) that a
//! stack walk reads from and writes back to a target.
//!
//! You probably don't want to use this crate directly, the [stackwalk][stackwalk] crate
//! provides the actual functionality of walking a thread's stack using the structs defined
//! in this crate.
//!
//! [stackwalk]: ../stackwalk/index.html

pub mod format;
