//! Persistence for the download engine
//!
//! The ledger is the engine's durable key-value store. It holds:
//!
//! - the queue record (active job plus wait list), rewritten after every
//!   queue mutation (debounced by the manager) and read once at start-up
//! - one completed-item record per successfully delivered job
//!
//! `FjallLedger` keeps both in an embedded Fjall keyspace; `MemoryLedger`
//! implements the same trait in memory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mediafetch::ledger::{FjallLedger, Ledger};
//!
//! let ledger = FjallLedger::open("data/ledger")?;
//! for record in ledger.list_completed()? {
//!     println!("{} -> {}", record.title, record.final_path);
//! }
//! ```

pub mod error;
mod memory;
pub mod partitions;
mod store;

pub use error::{LedgerError, Result};
pub use memory::MemoryLedger;
pub use store::{FjallLedger, Ledger};
