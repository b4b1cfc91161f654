//! SAL donation pool ledger
//!
//! Bookkeeping for donated GPU credit. Donors contribute money to a
//! platform bucket, stewards register to receive compute, and allocations
//! debit hours against the credit left in a bucket.
//!
//! # Layout
//!
//! ```text
//!  ┌──────────┐  donate / register / allocate  ┌──────────────┐
//!  │  Ledger  │───────────────────────────────►│ LedgerStore  │
//!  │ (memory) │◄───────────── load ────────────│ (JSON dir)   │
//!  └──────────┘                                └──────────────┘
//!       │
//!       └── status() ──► PoolStatus
//! ```
//!
//! ## Accounting rules
//! - Money is kept in whole cents, so a single allocation debits exactly
//!   its cost across the donations it touches
//! - Credit is consumed first-fit in donation order
//! - Every mutation saves the full snapshot before it becomes visible in
//!   memory; a failed save changes nothing
//! - Steward ids come from a persisted counter and are never reused

pub mod ledger;
pub mod models;
pub mod money;
pub mod pricing;
pub mod status;
pub mod storage;

pub use ledger::{DonationReceipt, Ledger, LedgerError, DEFAULT_EXPERIENCE};
pub use models::*;
pub use money::{Cents, MoneyParseError};
pub use pricing::{HourlyRate, PriceTable};
pub use status::{PlatformTotals, PoolStatus, StewardSummary};
pub use storage::{JsonDirStore, LedgerSnapshot, LedgerStore, MemoryStore, StorageError};
