//! Wallet backends.
//!
//! Two transports, one contract: `NwcBackend` speaks Nostr Wallet Connect
//! over relay websockets, `HttpWalletBackend` polls a custodial REST
//! service. Both push state changes through the same four callbacks and
//! honor the same lifecycle rules: `start` on a running backend is a state
//! error, `stop` is idempotent and bounded, and no callback fires after
//! `stop` returns.

pub mod dispatcher;
pub mod http;
pub mod nwc;

pub use dispatcher::{CallbackDispatcher, EventSink, WalletEvent};
pub use http::{HttpConfig, HttpWalletBackend};
pub use nwc::{NwcBackend, NwcConfig};

use crate::descriptor::ConnectionDescriptor;
use crate::error::WalletError;
use crate::ledger::{Payment, PaymentLedger};

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::warn;

/// The four notification hooks a frontend registers at `start`.
///
/// Callbacks are invoked serially from a dedicated task, never from the
/// caller of `start` and never concurrently with each other. They should
/// return quickly; a blocked callback stalls every later one.
pub struct WalletCallbacks {
	/// New confirmed balance in sats. Called once on the first successful
	/// fetch, then only when the value changes.
	pub balance: Box<dyn Fn(i64) + Send>,
	/// The payment ledger changed; read it back through `payments()`.
	pub payments: Box<dyn Fn() + Send>,
	/// The static receive code became known; read it back through
	/// `receive_code()`.
	pub receive_code: Box<dyn Fn() + Send>,
	/// A failure the backend could not recover from by itself.
	pub error: Box<dyn Fn(WalletError) + Send>,
}

/// A running synchronization session against one wallet service.
#[async_trait]
pub trait WalletBackend: Send + Sync {
	/// Begin synchronizing and register the callbacks. Fails with a state
	/// error if already running. Returns once the session is set up;
	/// synchronization itself proceeds in background tasks.
	async fn start(&self, callbacks: WalletCallbacks) -> Result<(), WalletError>;

	/// Tear the session down. All background work is stopped within a
	/// bounded time and no callback fires after this returns. Safe to call
	/// when not running.
	async fn stop(&self);

	fn is_running(&self) -> bool;

	/// Last known confirmed balance in sats.
	fn balance(&self) -> i64;

	/// Snapshot of the deduplicated, descending-sorted payment ledger.
	fn payments(&self) -> PaymentLedger;

	/// Static receive code, once known.
	fn receive_code(&self) -> Option<String>;
}

/// Construct the backend matching a parsed descriptor.
pub fn backend_from_descriptor(
	descriptor: ConnectionDescriptor,
) -> Result<Box<dyn WalletBackend>, WalletError> {
	match descriptor {
		ConnectionDescriptor::Nwc(uri) => {
			Ok(Box::new(NwcBackend::new(uri, NwcConfig::default())))
		}
		ConnectionDescriptor::Custodial { base_url, api_key } => Ok(Box::new(
			HttpWalletBackend::new(base_url, api_key, HttpConfig::default()),
		)),
	}
}

/// Mutable wallet state shared between the supervisor task and the
/// accessor methods.
#[derive(Debug, Default)]
pub(crate) struct WalletState {
	// `None` until the first successful fetch, so a true balance of zero
	// still counts as a change.
	balance_sats: Option<i64>,
	ledger: PaymentLedger,
	ledger_synced: bool,
	receive_code: Option<String>,
}

pub(crate) type SharedState = Arc<StdMutex<WalletState>>;

impl WalletState {
	pub(crate) fn shared() -> SharedState {
		Arc::new(StdMutex::new(WalletState::default()))
	}
}

/// Clear the snapshot. Each `start` begins from an empty ledger and
/// rebuilds it from the service.
pub(crate) fn reset_state(state: &SharedState) {
	*state.lock().unwrap_or_else(|e| e.into_inner()) = WalletState::default();
}

/// Record a new balance. Returns true when the stored value changed or
/// this is the first observation, so callers can suppress no-op callbacks.
pub(crate) fn update_balance(state: &SharedState, sats: i64) -> bool {
	let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
	if state.balance_sats == Some(sats) {
		return false;
	}
	state.balance_sats = Some(sats);
	true
}

/// Merge payments into the ledger. Returns true when at least one was new.
/// The first merge always reports a change, even an empty one, so the
/// ledger callback fires once per session regardless of history.
pub(crate) fn update_ledger(
	state: &SharedState,
	payments: impl IntoIterator<Item = Payment>,
) -> bool {
	let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
	let mut changed = !state.ledger_synced;
	state.ledger_synced = true;
	for payment in payments {
		changed |= state.ledger.add(payment);
	}
	changed
}

pub(crate) fn set_receive_code(state: &SharedState, code: String) {
	state.lock().unwrap_or_else(|e| e.into_inner()).receive_code = Some(code);
}

pub(crate) fn read_balance(state: &SharedState) -> i64 {
	state
		.lock()
		.unwrap_or_else(|e| e.into_inner())
		.balance_sats
		.unwrap_or(0)
}

/// Route a failure to the error callback. Malformed-message failures are
/// logged and dropped; they never reach the caller.
pub(crate) fn report_error(sink: &EventSink, error: WalletError) {
	if matches!(error, WalletError::Protocol(_)) {
		warn!("Dropping protocol error: {}", error);
		return;
	}
	sink.emit(WalletEvent::Error(error));
}

pub(crate) fn read_ledger(state: &SharedState) -> PaymentLedger {
	state
		.lock()
		.unwrap_or_else(|e| e.into_inner())
		.ledger
		.clone()
}

pub(crate) fn read_receive_code(state: &SharedState) -> Option<String> {
	state
		.lock()
		.unwrap_or_else(|e| e.into_inner())
		.receive_code
		.clone()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn balance_update_reports_change_only_once() {
		let state = WalletState::shared();
		assert!(update_balance(&state, 21));
		assert!(!update_balance(&state, 21));
		assert!(update_balance(&state, 22));
		assert_eq!(read_balance(&state), 22);
	}

	#[test]
	fn ledger_update_reports_no_change_for_duplicates() {
		let state = WalletState::shared();
		let batch = vec![Payment::new(10, 5, ""), Payment::new(11, 7, "tip")];
		assert!(update_ledger(&state, batch.clone()));
		assert!(!update_ledger(&state, batch));
		assert_eq!(read_ledger(&state).len(), 2);
	}

	#[test]
	fn first_balance_observation_signals_even_when_zero() {
		let state = WalletState::shared();
		assert!(update_balance(&state, 0));
		assert!(!update_balance(&state, 0));
		assert_eq!(read_balance(&state), 0);
	}

	#[test]
	fn first_ledger_merge_signals_even_when_empty() {
		let state = WalletState::shared();
		assert!(update_ledger(&state, Vec::new()));
		assert!(!update_ledger(&state, Vec::new()));
		assert!(read_ledger(&state).is_empty());
	}

	#[test]
	fn reset_rearms_the_first_observation_signals() {
		let state = WalletState::shared();
		assert!(update_balance(&state, 0));
		assert!(update_ledger(&state, Vec::new()));
		reset_state(&state);
		assert!(update_balance(&state, 0));
		assert!(update_ledger(&state, Vec::new()));
	}
}
