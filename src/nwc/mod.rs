//! Nostr Wallet Connect transport.
//!
//! Three layers, composed by the NWC backend:
//! - `codec`: the encrypted NIP-47 request/response/notification envelope,
//! - `relay`: one managed connection to one relay with its own reconnect
//!   state machine,
//! - `pool`: N relay connections presented as a single logical channel with
//!   relay-level deduplication.

pub mod codec;
pub mod pool;
pub mod relay;

pub use codec::{Event, Incoming, NwcCodec, NwcNotification, NwcResponse};
pub use pool::{PoolConfig, RelayPool};
pub use relay::{RelayConfig, RelayConnection, RelayState};
