//! Parallel plumbing: communicators, wire encoding and sparse exchanges.

pub mod communicator;
pub mod sparse_exchange;
pub mod wire;

pub use communicator::{CommTag, Communicator, NoComm, RayonComm};
pub use sparse_exchange::{CommSparse, exchange};
