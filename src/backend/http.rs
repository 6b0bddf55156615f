//! Custodial HTTP wallet backend.
//!
//! Polls an LNbits-compatible REST API: `/api/v1/wallet` for the balance,
//! `/api/v1/payments` for the ledger, both authenticated with an
//! `X-Api-Key` header. The first poll runs immediately; each later cycle
//! waits the configured interval. Individual requests retry with backoff
//! and only an exhausted retry budget reaches the error callback. The
//! static receive code is fetched once from the lnurlp extension; a 404
//! means the service has no such feature.

use crate::backend::{
	CallbackDispatcher, EventSink, SharedState, WalletBackend, WalletCallbacks, WalletEvent,
	WalletState, read_balance, read_ledger, read_receive_code, report_error, reset_state,
	set_receive_code, update_balance, update_ledger,
};
use crate::error::WalletError;
use crate::ledger::{Payment, PaymentLedger};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use serde_json::Value;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpConfig {
	/// Time between polling cycles.
	pub poll_interval: Duration,
	/// Per-request timeout.
	pub request_timeout: Duration,
	/// Total time one operation may spend retrying before it fails.
	pub retry_budget: Duration,
	/// Bound on joining the poll task during `stop`.
	pub stop_timeout: Duration,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(10),
			request_timeout: Duration::from_secs(10),
			retry_budget: Duration::from_secs(5),
			stop_timeout: Duration::from_secs(2),
		}
	}
}

struct Running {
	task: tokio::task::JoinHandle<()>,
	cancel: CancellationToken,
	dispatcher: CallbackDispatcher,
}

/// Wallet backend polling a custodial REST service.
pub struct HttpWalletBackend {
	base_url: String,
	api_key: String,
	config: HttpConfig,
	state: SharedState,
	running: StdMutex<Option<Running>>,
}

impl HttpWalletBackend {
	pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, config: HttpConfig) -> Self {
		let base_url = base_url.into();
		Self {
			base_url: base_url.trim_end_matches('/').to_string(),
			api_key: api_key.into(),
			config,
			state: WalletState::shared(),
			running: StdMutex::new(None),
		}
	}
}

#[async_trait]
impl WalletBackend for HttpWalletBackend {
	async fn start(&self, callbacks: WalletCallbacks) -> Result<(), WalletError> {
		let client = reqwest::Client::builder()
			.timeout(self.config.request_timeout)
			.build()?;

		let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
		if running.is_some() {
			return Err(WalletError::State("backend is already started".to_string()));
		}

		info!("Starting HTTP backend against {}", self.base_url);

		reset_state(&self.state);
		let dispatcher = CallbackDispatcher::start(callbacks);
		let cancel = CancellationToken::new();
		let task = tokio::spawn(poll_loop(
			client,
			self.base_url.clone(),
			self.api_key.clone(),
			self.state.clone(),
			dispatcher.sink(),
			cancel.clone(),
			self.config.clone(),
		));

		*running = Some(Running {
			task,
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

		info!("Stopping HTTP backend");
		running.cancel.cancel();
		let abort = running.task.abort_handle();
		if timeout(self.config.stop_timeout, running.task).await.is_err() {
			warn!("HTTP poll task did not stop in time, aborting");
			abort.abort();
		}
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

async fn poll_loop(
	client: reqwest::Client,
	base_url: String,
	api_key: String,
	state: SharedState,
	sink: EventSink,
	cancel: CancellationToken,
	config: HttpConfig,
) {
	// One-time receive code lookup; a service without the extension is a
	// feature gap, not a sync failure.
	let code = tokio::select! {
		_ = cancel.cancelled() => return,
		result = fetch_receive_code(&client, &base_url, &api_key, &config) => result,
	};
	match code {
		Ok(code) => {
			set_receive_code(&state, code);
			sink.emit(WalletEvent::ReceiveCodeChanged);
		}
		Err(e) => report_error(&sink, e),
	}

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = poll_once(&client, &base_url, &api_key, &state, &sink, &config) => {}
		}
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep(config.poll_interval) => {}
		}
	}
	debug!("HTTP poll task stopped");
}

/// One polling cycle. The two endpoints are polled independently: a broken
/// balance endpoint never starves ledger polling, and each exhausted retry
/// budget is reported on its own.
async fn poll_once(
	client: &reqwest::Client,
	base_url: &str,
	api_key: &str,
	state: &SharedState,
	sink: &EventSink,
	config: &HttpConfig,
) {
	if let Err(e) = poll_balance(client, base_url, api_key, state, sink, config).await {
		warn!("Balance poll failed: {}", e);
		report_error(sink, e);
	}
	if let Err(e) = poll_payments(client, base_url, api_key, state, sink, config).await {
		warn!("Ledger poll failed: {}", e);
		report_error(sink, e);
	}
}

async fn poll_balance(
	client: &reqwest::Client,
	base_url: &str,
	api_key: &str,
	state: &SharedState,
	sink: &EventSink,
	config: &HttpConfig,
) -> Result<(), WalletError> {
	let wallet = get_json(client, &format!("{}/api/v1/wallet", base_url), api_key, config).await?;
	let sats = wallet["balance"]
		.as_i64()
		.map(|msat| msat / 1000)
		.ok_or_else(|| WalletError::Protocol("wallet response without balance".to_string()))?;
	if update_balance(state, sats) {
		sink.emit(WalletEvent::BalanceChanged(sats));
	}
	Ok(())
}

async fn poll_payments(
	client: &reqwest::Client,
	base_url: &str,
	api_key: &str,
	state: &SharedState,
	sink: &EventSink,
	config: &HttpConfig,
) -> Result<(), WalletError> {
	let payments =
		get_json(client, &format!("{}/api/v1/payments", base_url), api_key, config).await?;
	let entries = payments
		.as_array()
		.map(|list| {
			list.iter()
				.filter_map(payment_from_entry)
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	if update_ledger(state, entries) {
		sink.emit(WalletEvent::PaymentsChanged);
	}
	Ok(())
}

/// Map one `/api/v1/payments` entry to a ledger payment. Amounts are
/// signed millisats on the wire. Pending entries are skipped.
fn payment_from_entry(entry: &Value) -> Option<Payment> {
	if entry["pending"].as_bool().unwrap_or(false) {
		return None;
	}
	let amount_msat = entry["amount"].as_i64()?;
	let epoch_time = entry["time"]
		.as_i64()
		.or_else(|| entry["time"].as_f64().map(|t| t as i64))?;
	let comment = entry["memo"].as_str().unwrap_or_default().to_string();
	Some(Payment::new(epoch_time, amount_msat / 1000, comment))
}

async fn fetch_receive_code(
	client: &reqwest::Client,
	base_url: &str,
	api_key: &str,
	config: &HttpConfig,
) -> Result<String, WalletError> {
	let url = format!("{}/lnurlp/api/v1/links", base_url);
	let url = url.as_str();
	let links = with_retry(config, || async move {
		let response = client
			.get(url)
			.header("X-Api-Key", api_key)
			.send()
			.await
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))?;
		if response.status() == StatusCode::NOT_FOUND {
			return Err(backoff::Error::permanent(WalletError::FeatureUnavailable(
				"wallet service has no static receive code".to_string(),
			)));
		}
		let response = response
			.error_for_status()
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))?;
		response
			.json::<Value>()
			.await
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))
	})
	.await?;

	links
		.as_array()
		.and_then(|list| list.first())
		.and_then(|link| link["lnurl"].as_str())
		.map(str::to_string)
		.ok_or_else(|| {
			WalletError::FeatureUnavailable(
				"wallet service has no static receive code".to_string(),
			)
		})
}

async fn get_json(
	client: &reqwest::Client,
	url: &str,
	api_key: &str,
	config: &HttpConfig,
) -> Result<Value, WalletError> {
	with_retry(config, || async move {
		let response = client
			.get(url)
			.header("X-Api-Key", api_key)
			.send()
			.await
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))?;
		let response = response
			.error_for_status()
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))?;
		response
			.json::<Value>()
			.await
			.map_err(|e| backoff::Error::transient(WalletError::from(e)))
	})
	.await
}

/// Retry an operation with exponential backoff until it succeeds or the
/// retry budget runs out.
async fn with_retry<T, F, Fut>(config: &HttpConfig, operation: F) -> Result<T, WalletError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, backoff::Error<WalletError>>>,
{
	let policy = ExponentialBackoff {
		initial_interval: Duration::from_millis(500),
		max_interval: Duration::from_secs(2),
		max_elapsed_time: Some(config.retry_budget),
		..ExponentialBackoff::default()
	};
	backoff::future::retry(policy, operation).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn silent_callbacks() -> WalletCallbacks {
		WalletCallbacks {
			balance: Box::new(|_| {}),
			payments: Box::new(|| {}),
			receive_code: Box::new(|| {}),
			error: Box::new(|_| {}),
		}
	}

	#[test]
	fn payment_entry_maps_msats_time_and_memo() {
		let entry = json!({
			"amount": 21000, "time": 1700000000, "memo": "coffee", "pending": false
		});
		assert_eq!(
			payment_from_entry(&entry).unwrap(),
			Payment::new(1700000000, 21, "coffee")
		);
	}

	#[test]
	fn pending_and_malformed_entries_are_skipped() {
		assert!(payment_from_entry(&json!({
			"amount": 21000, "time": 1, "pending": true
		}))
		.is_none());
		assert!(payment_from_entry(&json!({ "time": 1 })).is_none());
		assert!(payment_from_entry(&json!({ "amount": 1000 })).is_none());
	}

	#[test]
	fn outgoing_entries_keep_their_sign() {
		let entry = json!({ "amount": -42000, "time": 5, "memo": "" });
		assert_eq!(payment_from_entry(&entry).unwrap(), Payment::new(5, -42, ""));
	}

	#[tokio::test]
	async fn double_start_is_a_state_error() {
		let backend = HttpWalletBackend::new(
			"http://127.0.0.1:1",
			"testkey",
			HttpConfig::default(),
		);
		backend.start(silent_callbacks()).await.unwrap();
		assert!(matches!(
			backend.start(silent_callbacks()).await,
			Err(WalletError::State(_))
		));
		backend.stop().await;
		assert!(!backend.is_running());
	}

	#[tokio::test]
	async fn base_url_trailing_slash_is_normalized() {
		let backend =
			HttpWalletBackend::new("http://127.0.0.1:1/", "k", HttpConfig::default());
		assert_eq!(backend.base_url, "http://127.0.0.1:1");
	}
}
