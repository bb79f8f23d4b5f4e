//! Staged command pipelines.
//!
//! A [`NamedChain`] is a long-lived factory bound to a logging context. Each
//! workflow (provision, start, stop, teardown) asks it for a fresh
//! [`ActiveChain`], appends stage markers and fallible operations, then
//! consumes it with [`ActiveChain::exec`].
//!
//! ```ignore
//! let chain = NamedChain::new("k3s");
//! let mut a = chain.init();
//! a.stage("starting");
//! a.add(|| host.run(&["sudo", "service", "k3s", "start"]));
//! a.retry("", Duration::from_secs(2), 10, |_| host.run(&["kubectl", "cluster-info"]));
//! a.exec().await?; // error at 'starting': command failed: ...
//! ```
//!
//! Execution is fail-fast with no rollback: the first failing operation stops
//! the chain, and its error is tagged with the most recently entered stage.

mod chain;
mod error;

pub use chain::{ActiveChain, NamedChain};
pub use error::{BoxError, ChainError, Result};
