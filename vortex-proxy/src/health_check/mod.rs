//! Backend reachability checks.

pub mod prober;
