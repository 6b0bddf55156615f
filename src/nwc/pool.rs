//! Relay pool: N connections, one logical channel.
//!
//! Requests fan out to every subscribed relay; inbound events fan in through
//! a single dispatcher task. The same response or notification usually
//! arrives once per relay, so the dispatcher deduplicates before anything
//! reaches the backend: a response consumes its pending-request slot and
//! later copies find nothing to match, payment notifications are tracked by
//! the decoded payment's equality in a bounded seen-set.

use crate::error::WalletError;
use crate::ledger::Payment;
use crate::nwc::codec::{Incoming, NwcCodec, NwcNotification, NwcResponse, payment_from_transaction};
use crate::nwc::relay::{RelayConfig, RelayConnection, RelayIncoming};

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Tunables for the pool and its member connections.
#[derive(Debug, Clone)]
pub struct PoolConfig {
	/// How long one `request` waits for a matching response.
	pub request_timeout: Duration,
	pub relay: RelayConfig,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(10),
			relay: RelayConfig::default(),
		}
	}
}

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<NwcResponse>>>>;

/// A set of relay connections sharing one subscription and one outbound
/// request stream.
pub struct RelayPool {
	codec: Arc<NwcCodec>,
	connections: Vec<RelayConnection>,
	pending: PendingMap,
	dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
	config: PoolConfig,
}

impl RelayPool {
	/// Spawn one connection per relay URL plus the fan-in dispatcher.
	/// Deduplicated notifications are forwarded to `notification_tx`.
	pub fn start(
		codec: Arc<NwcCodec>,
		relays: &[String],
		notification_tx: mpsc::UnboundedSender<NwcNotification>,
		config: PoolConfig,
	) -> Self {
		let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
		let connections: Vec<RelayConnection> = relays
			.iter()
			.map(|url| {
				RelayConnection::spawn(
					url.clone(),
					codec.clone(),
					incoming_tx.clone(),
					config.relay.clone(),
				)
			})
			.collect();
		// The dispatcher ends when the last connection task drops its sender.
		drop(incoming_tx);

		let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
		let dispatcher = tokio::spawn(dispatch(incoming_rx, pending.clone(), notification_tx));

		Self {
			codec,
			connections,
			pending,
			dispatcher: Mutex::new(Some(dispatcher)),
			config,
		}
	}

	/// Number of connections currently subscribed.
	pub fn connected_count(&self) -> usize {
		self.connections.iter().filter(|c| c.is_subscribed()).count()
	}

	/// Send one request through every subscribed relay and wait for the first
	/// matching response. Fails with a transport error when no relay is
	/// available or no response arrives within the configured timeout.
	pub async fn request(&self, method: &str, params: Value) -> Result<NwcResponse, WalletError> {
		let event = self.codec.request(method, params)?;
		let request_id = event.id.clone();

		let (tx, rx) = oneshot::channel();
		self.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(request_id.clone(), tx);

		let sent = self
			.connections
			.iter()
			.filter(|c| c.send_event(event.clone()))
			.count();
		if sent == 0 {
			self.remove_pending(&request_id);
			return Err(WalletError::Transport(
				"no subscribed relay to send through".to_string(),
			));
		}
		debug!("Sent {} request {} via {} relay(s)", method, request_id, sent);

		match timeout(self.config.request_timeout, rx).await {
			Ok(Ok(response)) => Ok(response),
			Ok(Err(_)) => {
				self.remove_pending(&request_id);
				Err(WalletError::Transport(
					"pool stopped while waiting for response".to_string(),
				))
			}
			Err(_) => {
				self.remove_pending(&request_id);
				Err(WalletError::Transport(format!(
					"no response to {} within {:?}",
					method, self.config.request_timeout
				)))
			}
		}
	}

	fn remove_pending(&self, request_id: &str) {
		self.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(request_id);
	}

	/// Disconnect every relay and stop the dispatcher. Bounded by the relay
	/// stop timeout; the dispatcher is aborted if it overruns. Idempotent.
	pub async fn stop(&self) {
		futures::future::join_all(self.connections.iter().map(|c| c.disconnect())).await;

		let handle = self.dispatcher.lock().await.take();
		if let Some(handle) = handle {
			let abort = handle.abort_handle();
			if timeout(self.config.relay.stop_timeout, handle).await.is_err() {
				warn!("Pool dispatcher did not stop in time, aborting");
				abort.abort();
			}
		}

		// Waiters still parked in `request` get a closed-channel error.
		self.pending
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clear();
	}
}

async fn dispatch(
	mut incoming_rx: mpsc::UnboundedReceiver<RelayIncoming>,
	pending: PendingMap,
	notification_tx: mpsc::UnboundedSender<NwcNotification>,
) {
	let mut seen = SeenPayments::new(256);
	while let Some((relay, incoming)) = incoming_rx.recv().await {
		match incoming {
			Incoming::Response(response) => {
				let waiter = pending
					.lock()
					.unwrap_or_else(|e| e.into_inner())
					.remove(&response.request_id);
				match waiter {
					Some(tx) => {
						let _ = tx.send(response);
					}
					None => {
						debug!(
							"Dropping duplicate or late response {} from {}",
							response.request_id, relay
						);
					}
				}
			}
			Incoming::Notification(notification) => {
				// Dedup on the decoded payment; notifications that do not
				// carry one pass through and the ledger re-checks anyway.
				if let Some(payment) = payment_from_transaction(&notification.payload) {
					if !seen.insert(payment) {
						debug!("Dropping duplicate notification from {}", relay);
						continue;
					}
				}
				let _ = notification_tx.send(notification);
			}
		}
	}
	debug!("Pool dispatcher stopped");
}

/// Bounded set of recently seen payments.
struct SeenPayments {
	keys: HashSet<Payment>,
	order: VecDeque<Payment>,
	capacity: usize,
}

impl SeenPayments {
	fn new(capacity: usize) -> Self {
		Self {
			keys: HashSet::new(),
			order: VecDeque::new(),
			capacity,
		}
	}

	/// Returns true when the payment is new.
	fn insert(&mut self, payment: Payment) -> bool {
		if !self.keys.insert(payment.clone()) {
			return false;
		}
		self.order.push_back(payment);
		while self.order.len() > self.capacity {
			if let Some(evicted) = self.order.pop_front() {
				self.keys.remove(&evicted);
			}
		}
		true
	}
}
