//! Nostr Wallet Connect backend.
//!
//! On `start` the backend opens a relay pool, performs an initial
//! synchronization (`get_balance` + `list_transactions`, retried with
//! growing delays) and then reacts to push notifications: each settled
//! payment is merged into the ledger and the balance is re-queried. The
//! static receive code comes from the `lud16` parameter of the connection
//! URI; a URI without one surfaces a single feature-unavailable error.

use crate::backend::{
	CallbackDispatcher, EventSink, SharedState, WalletBackend, WalletCallbacks, WalletEvent,
	WalletState, read_balance, read_ledger, read_receive_code, report_error, reset_state,
	set_receive_code, update_balance, update_ledger,
};
use crate::descriptor::NwcUri;
use crate::error::WalletError;
use crate::ledger::PaymentLedger;
use crate::nwc::codec::{NwcCodec, NwcNotification, NwcResponse, balance_sats, payment_from_transaction};
use crate::nwc::pool::{PoolConfig, RelayPool};

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the NWC backend.
#[derive(Debug, Clone)]
pub struct NwcConfig {
	pub pool: PoolConfig,
	/// Attempts for the initial synchronization before giving up.
	pub sync_retries: u32,
	/// Delay before the first retry; doubles per attempt up to 30s.
	pub sync_retry_delay: Duration,
	/// Page size for `list_transactions`.
	pub list_limit: u32,
	/// Bound on joining the supervisor task during `stop`.
	pub stop_timeout: Duration,
}

impl Default for NwcConfig {
	fn default() -> Self {
		Self {
			pool: PoolConfig::default(),
			sync_retries: 3,
			sync_retry_delay: Duration::from_secs(1),
			list_limit: 50,
			stop_timeout: Duration::from_secs(2),
		}
	}
}

struct Running {
	pool: Arc<RelayPool>,
	supervisor: tokio::task::JoinHandle<()>,
	cancel: CancellationToken,
	dispatcher: CallbackDispatcher,
}

/// Wallet backend speaking NIP-47 over one or more Nostr relays.
pub struct NwcBackend {
	uri: NwcUri,
	config: NwcConfig,
	state: SharedState,
	running: StdMutex<Option<Running>>,
}

impl NwcBackend {
	pub fn new(uri: NwcUri, config: NwcConfig) -> Self {
		Self {
			uri,
			config,
			state: WalletState::shared(),
			running: StdMutex::new(None),
		}
	}

	/// Number of relays currently subscribed, zero when stopped.
	pub fn connected_relays(&self) -> usize {
		self.running
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.as_ref()
			.map(|r| r.pool.connected_count())
			.unwrap_or(0)
	}
}

#[async_trait]
impl WalletBackend for NwcBackend {
	async fn start(&self, callbacks: WalletCallbacks) -> Result<(), WalletError> {
		let codec = Arc::new(NwcCodec::new(&self.uri)?);

		let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
		if running.is_some() {
			return Err(WalletError::State("backend is already started".to_string()));
		}

		info!(
			"Starting NWC backend with {} relay(s) as client {}",
			self.uri.relays.len(),
			codec.client_pubkey()
		);

		reset_state(&self.state);
		let dispatcher = CallbackDispatcher::start(callbacks);
		let (notification_tx, notification_rx) = mpsc::unbounded_channel();
		let pool = Arc::new(RelayPool::start(
			codec,
			&self.uri.relays,
			notification_tx,
			self.config.pool.clone(),
		));
		let cancel = CancellationToken::new();

		let supervisor = tokio::spawn(supervise(
			pool.clone(),
			notification_rx,
			self.state.clone(),
			dispatcher.sink(),
			cancel.clone(),
			self.uri.lud16.clone(),
			self.config.clone(),
		));

		*running = Some(Running {
			pool,
			supervisor,
			cancel,
			dispatcher,
		});
		Ok(())
	}

	async fn stop(&self) {
		let running = self
			.running
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.take();
		let Some(running) = running else { return };

		info!("Stopping NWC backend");
		running.cancel.cancel();
		running.pool.stop().await;

		let abort = running.supervisor.abort_handle();
		if timeout(self.config.stop_timeout, running.supervisor)
			.await
			.is_err()
		{
			warn!("NWC supervisor did not stop in time, aborting");
			abort.abort();
		}

		// Queued callbacks run to completion, then silence.
		running.dispatcher.shutdown().await;
	}

	fn is_running(&self) -> bool {
		self.running
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.is_some()
	}

	fn balance(&self) -> i64 {
		read_balance(&self.state)
	}

	fn payments(&self) -> PaymentLedger {
		read_ledger(&self.state)
	}

	fn receive_code(&self) -> Option<String> {
		read_receive_code(&self.state)
	}
}

async fn supervise(
	pool: Arc<RelayPool>,
	mut notification_rx: mpsc::UnboundedReceiver<NwcNotification>,
	state: SharedState,
	sink: EventSink,
	cancel: CancellationToken,
	lud16: Option<String>,
	config: NwcConfig,
) {
	// The receive code is static, known before any relay traffic.
	match lud16 {
		Some(code) => {
			set_receive_code(&state, code);
			sink.emit(WalletEvent::ReceiveCodeChanged);
		}
		None => {
			sink.emit(WalletEvent::Error(WalletError::FeatureUnavailable(
				"connection has no static receive code (lud16)".to_string(),
			)));
		}
	}

	// Initial synchronization. Balance and ledger are independent queries:
	// one failing never skips the other, and each only re-runs until its
	// own first success.
	let mut delay = config.sync_retry_delay;
	let mut attempt = 0;
	let mut balance_synced = false;
	let mut ledger_synced = false;
	loop {
		let errors = tokio::select! {
			_ = cancel.cancelled() => return,
			errors = async {
				let mut errors = Vec::new();
				if !balance_synced {
					match sync_balance(&pool, &state, &sink).await {
						Ok(()) => balance_synced = true,
						Err(e) => errors.push(e),
					}
				}
				if !ledger_synced {
					match sync_ledger(&pool, &state, &sink, &config).await {
						Ok(()) => ledger_synced = true,
						Err(e) => errors.push(e),
					}
				}
				errors
			} => errors,
		};
		if errors.is_empty() {
			break;
		}
		attempt += 1;
		if attempt >= config.sync_retries {
			warn!("Initial sync gave up after {} attempts", attempt);
			for e in errors {
				report_error(&sink, e);
			}
			break;
		}
		for e in &errors {
			debug!("Initial sync attempt {} failed, retrying: {}", attempt, e);
		}
		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(delay) => {}
		}
		delay = (delay * 2).min(Duration::from_secs(30));
	}

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			maybe = notification_rx.recv() => {
				let Some(notification) = maybe else { break };
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = handle_notification(notification, &pool, &state, &sink) => {}
				}
			}
		}
	}
	debug!("NWC supervisor stopped");
}

async fn sync_balance(
	pool: &RelayPool,
	state: &SharedState,
	sink: &EventSink,
) -> Result<(), WalletError> {
	let response = pool.request("get_balance", json!({})).await?;
	let result = check_response(response)?;
	let sats = balance_sats(&result).ok_or_else(|| {
		WalletError::Protocol("get_balance result without balance".to_string())
	})?;
	if update_balance(state, sats) {
		sink.emit(WalletEvent::BalanceChanged(sats));
	}
	Ok(())
}

async fn sync_ledger(
	pool: &RelayPool,
	state: &SharedState,
	sink: &EventSink,
	config: &NwcConfig,
) -> Result<(), WalletError> {
	let response = pool
		.request("list_transactions", json!({ "limit": config.list_limit }))
		.await?;
	let result = check_response(response)?;
	let payments = result["transactions"]
		.as_array()
		.map(|txs| {
			txs.iter()
				.filter_map(payment_from_transaction)
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	if update_ledger(state, payments) {
		sink.emit(WalletEvent::PaymentsChanged);
	}
	Ok(())
}

/// A rejection from the wallet service is a well-formed message, not a
/// protocol violation, so it may travel through the error callback.
fn check_response(response: NwcResponse) -> Result<serde_json::Value, WalletError> {
	match response.error {
		Some(message) => Err(WalletError::Transport(format!(
			"wallet service rejected {}: {}",
			response.result_type, message
		))),
		None => Ok(response.result),
	}
}

async fn handle_notification(
	notification: NwcNotification,
	pool: &RelayPool,
	state: &SharedState,
	sink: &EventSink,
) {
	match notification.notification_type.as_str() {
		"payment_received" | "payment_sent" => {
			if let Some(payment) = payment_from_transaction(&notification.payload) {
				debug!("Payment notification: {}", payment);
				if update_ledger(state, [payment]) {
					sink.emit(WalletEvent::PaymentsChanged);
				}
			}
			// The notification does not carry the new balance, ask for it.
			match pool.request("get_balance", json!({})).await {
				Ok(response) => {
					if let Ok(result) = check_response(response) {
						if let Some(sats) = balance_sats(&result) {
							if update_balance(state, sats) {
								sink.emit(WalletEvent::BalanceChanged(sats));
							}
						}
					}
				}
				Err(e) => debug!("Balance refresh after notification failed: {}", e),
			}
		}
		other => debug!("Ignoring notification type {}", other),
	}
}
