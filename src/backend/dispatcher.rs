//! Serialized callback delivery.
//!
//! Backends never invoke user callbacks from their own tasks. Every state
//! change becomes a `WalletEvent` queued to a single consumer task, so
//! callbacks run strictly one at a time, in emission order, and never
//! reentrantly. `shutdown` closes the queue and waits for already queued
//! callbacks to finish, which is what lets `stop` guarantee silence after it
//! returns.

use crate::backend::WalletCallbacks;
use crate::error::WalletError;

use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use std::time::Duration;
use tracing::{debug, warn};

/// One observable state change, in the order it happened.
#[derive(Debug)]
pub enum WalletEvent {
	BalanceChanged(i64),
	PaymentsChanged,
	ReceiveCodeChanged,
	Error(WalletError),
}

/// Cloneable producer side of the dispatcher queue.
#[derive(Clone)]
pub struct EventSink {
	tx: mpsc::UnboundedSender<WalletEvent>,
}

impl EventSink {
	/// Queue an event. Silently drops after shutdown.
	pub fn emit(&self, event: WalletEvent) {
		let _ = self.tx.send(event);
	}
}

/// Owns the consumer task that turns queued events into callback calls.
pub struct CallbackDispatcher {
	tx: StdMutex<Option<mpsc::UnboundedSender<WalletEvent>>>,
	task: Mutex<Option<tokio::task::JoinHandle<()>>>,
	drain_timeout: Duration,
}

impl CallbackDispatcher {
	pub fn start(callbacks: WalletCallbacks) -> Self {
		Self::with_drain_timeout(callbacks, Duration::from_secs(2))
	}

	pub fn with_drain_timeout(callbacks: WalletCallbacks, drain_timeout: Duration) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				deliver(&callbacks, event);
			}
			debug!("Callback dispatcher stopped");
		});
		Self {
			tx: StdMutex::new(Some(tx)),
			task: Mutex::new(Some(task)),
			drain_timeout,
		}
	}

	pub fn sink(&self) -> EventSink {
		let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
		// After shutdown a sink still exists but its sends go nowhere.
		let tx = tx.unwrap_or_else(|| {
			let (tx, _closed_rx) = mpsc::unbounded_channel();
			tx
		});
		EventSink { tx }
	}

	/// Close the queue and wait for queued callbacks to run. Bounded; the
	/// consumer is aborted if a callback blocks past the timeout. Idempotent.
	pub async fn shutdown(&self) {
		// Dropping the sender lets the consumer drain and exit.
		self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
		let handle = self.task.lock().await.take();
		if let Some(handle) = handle {
			let abort = handle.abort_handle();
			if timeout(self.drain_timeout, handle).await.is_err() {
				warn!("Callback dispatcher did not drain in time, aborting");
				abort.abort();
			}
		}
	}
}

fn deliver(callbacks: &WalletCallbacks, event: WalletEvent) {
	match event {
		WalletEvent::BalanceChanged(sats) => (callbacks.balance)(sats),
		WalletEvent::PaymentsChanged => (callbacks.payments)(),
		WalletEvent::ReceiveCodeChanged => (callbacks.receive_code)(),
		WalletEvent::Error(error) => (callbacks.error)(error),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicI64, Ordering};

	fn counting_callbacks(log: Arc<StdMutex<Vec<String>>>) -> WalletCallbacks {
		let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log);
		WalletCallbacks {
			balance: Box::new(move |sats| a.lock().unwrap().push(format!("balance:{}", sats))),
			payments: Box::new(move || b.lock().unwrap().push("payments".to_string())),
			receive_code: Box::new(move || c.lock().unwrap().push("code".to_string())),
			error: Box::new(move |e| d.lock().unwrap().push(format!("error:{}", e))),
		}
	}

	#[tokio::test]
	async fn events_are_delivered_in_emission_order() {
		let log = Arc::new(StdMutex::new(Vec::new()));
		let dispatcher = CallbackDispatcher::start(counting_callbacks(log.clone()));
		let sink = dispatcher.sink();

		sink.emit(WalletEvent::BalanceChanged(21));
		sink.emit(WalletEvent::PaymentsChanged);
		sink.emit(WalletEvent::ReceiveCodeChanged);
		dispatcher.shutdown().await;

		assert_eq!(
			*log.lock().unwrap(),
			vec![
				"balance:21".to_string(),
				"payments".to_string(),
				"code".to_string(),
			]
		);
	}

	#[tokio::test]
	async fn shutdown_drains_queued_events_and_silences_later_emits() {
		let log = Arc::new(StdMutex::new(Vec::new()));
		let dispatcher = CallbackDispatcher::start(counting_callbacks(log.clone()));
		let sink = dispatcher.sink();

		for i in 0..100 {
			sink.emit(WalletEvent::BalanceChanged(i));
		}
		dispatcher.shutdown().await;
		assert_eq!(log.lock().unwrap().len(), 100);

		sink.emit(WalletEvent::PaymentsChanged);
		dispatcher.shutdown().await;
		assert_eq!(log.lock().unwrap().len(), 100);
	}

	#[tokio::test]
	async fn callbacks_never_run_concurrently() {
		let in_flight = Arc::new(AtomicI64::new(0));
		let max_seen = Arc::new(AtomicI64::new(0));
		let (f, m) = (in_flight.clone(), max_seen.clone());
		let callbacks = WalletCallbacks {
			balance: Box::new(move |_| {
				let now = f.fetch_add(1, Ordering::SeqCst) + 1;
				m.fetch_max(now, Ordering::SeqCst);
				std::thread::sleep(Duration::from_millis(1));
				f.fetch_sub(1, Ordering::SeqCst);
			}),
			payments: Box::new(|| {}),
			receive_code: Box::new(|| {}),
			error: Box::new(|_| {}),
		};
		let dispatcher =
			CallbackDispatcher::with_drain_timeout(callbacks, Duration::from_secs(5));
		let sink = dispatcher.sink();
		for i in 0..20 {
			sink.emit(WalletEvent::BalanceChanged(i));
		}
		dispatcher.shutdown().await;
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}
}
