//! Lightning wallet synchronization engine.
//!
//! Maintains a live view of balance and payment history against either a
//! Nostr Wallet Connect (NIP-47) endpoint reached through one or more relays,
//! or a custodial HTTP wallet service, and exposes both through one uniform
//! callback contract. The UI layer registers four callbacks, calls `start()`,
//! and re-reads snapshots whenever a callback fires.

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod ledger;
pub mod nwc;

pub use backend::{WalletBackend, WalletCallbacks, backend_from_descriptor};
pub use descriptor::{ConnectionDescriptor, NwcUri};
pub use error::WalletError;
pub use ledger::{Payment, PaymentLedger};
