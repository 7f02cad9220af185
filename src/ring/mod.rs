//! Consistent-hashing ring membership.
//!
//! The ring is one [`RingDesc`] value stored under a single key of a
//! [`KvStore`]. Instances own random `u32` tokens; a series belongs to the
//! instance owning the first token at or after its hash.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  get / CAS / watch  ┌──────────────────────────────┐
//! │  RingClient  │ ──────────────────► │ KvStore["ring"] = RingDesc   │
//! │ (per node)   │                     │  ing-1: ACTIVE  [t1, t7, ..] │
//! └──────────────┘                     │  ing-2: PENDING []           │
//!                                      └──────────────────────────────┘
//! ```

mod client;
mod desc;
mod kv;
mod tokens;

pub use client::RingClient;
pub use desc::{InstanceDesc, NodeState, RingDesc};
pub use kv::{CasResult, InMemoryKvStore, KvStore, Versioned};
pub use tokens::generate_tokens;
