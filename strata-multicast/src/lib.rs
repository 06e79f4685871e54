//! STRATA Multicast - Shared Upstream Fan-Out
//!
//! Runs one upstream producer on behalf of many concurrent subscribers, so
//! a single fetch can answer every reader of a key.
//!
//! # Design
//!
//! - A channel manager actor owns the subscriber list, the replay buffer
//!   and the current producer. It is driven entirely by commands on a
//!   bounded queue.
//! - The producer waits for `min_acks` subscribers to take each value
//!   before pulling the next one. A subscriber that goes away acknowledges
//!   implicitly, so it cannot stall the rest.
//! - Subscribers that join after a value went out, but before the upstream
//!   finished, get a fresh upstream run of their own.
//!
//! # Example
//!
//! ```ignore
//! let upstream: UpstreamFactory<u32> = Arc::new(|| stream::iter([Ok(1), Ok(2)]).boxed());
//! let multicaster = Multicaster::new(MulticastConfig::default(), upstream)?;
//! let a = multicaster.new_downstream(false).await?;
//! let b = multicaster.new_downstream(false).await?;
//! // a and b both see 1 then 2; the upstream ran once
//! ```

mod ack;
mod manager;
mod multicaster;
mod producer;

pub use multicaster::{Downstream, Multicaster};
pub use producer::UpstreamFactory;
