//! Single relay connection management.
//!
//! One `RelayConnection` owns exactly one relay socket and its lifecycle:
//! connect, subscribe, read, and reconnect with exponential backoff. Each
//! connection runs in its own task so a slow or failing relay never blocks
//! its siblings. `disconnect()` cancels cooperatively and joins the task
//! within a bounded timeout, guaranteeing no events are delivered upward
//! after it returns.

use crate::nwc::codec::{Event, Incoming, NwcCodec};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
	Disconnected,
	Connecting,
	Connected,
	Subscribed,
}

/// Tunables for one relay connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
	pub connect_timeout: Duration,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	/// How long `disconnect()` waits for the task before force-aborting it.
	pub stop_timeout: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(10),
			initial_backoff: Duration::from_secs(1),
			max_backoff: Duration::from_secs(30),
			stop_timeout: Duration::from_secs(2),
		}
	}
}

/// Decoded event delivered to the owning pool, tagged with the relay it
/// arrived through.
pub type RelayIncoming = (String, Incoming);

/// One managed connection to one relay endpoint.
pub struct RelayConnection {
	url: String,
	state: Arc<RwLock<RelayState>>,
	outbound_tx: mpsc::UnboundedSender<Event>,
	cancel: CancellationToken,
	task: Mutex<Option<tokio::task::JoinHandle<()>>>,
	config: RelayConfig,
}

impl RelayConnection {
	/// Spawn the connection task. The task keeps reconnecting with backoff
	/// until cancelled; decoded inbound events go to `incoming_tx`.
	pub fn spawn(
		url: String,
		codec: Arc<NwcCodec>,
		incoming_tx: mpsc::UnboundedSender<RelayIncoming>,
		config: RelayConfig,
	) -> Self {
		let state = Arc::new(RwLock::new(RelayState::Disconnected));
		let cancel = CancellationToken::new();
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		let task = tokio::spawn(run_connection(
			url.clone(),
			codec,
			incoming_tx,
			outbound_rx,
			state.clone(),
			cancel.clone(),
			config.clone(),
		));

		Self {
			url,
			state,
			outbound_tx,
			cancel,
			task: Mutex::new(Some(task)),
			config,
		}
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn state(&self) -> RelayState {
		*self.state.read().unwrap_or_else(|e| e.into_inner())
	}

	pub fn is_subscribed(&self) -> bool {
		self.state() == RelayState::Subscribed
	}

	/// Hand a signed request to this connection. Returns false when the
	/// connection is not currently subscribed; redundant delivery through
	/// sibling relays covers the gap.
	pub fn send_event(&self, event: Event) -> bool {
		if !self.is_subscribed() {
			return false;
		}
		self.outbound_tx.send(event).is_ok()
	}

	/// Cancel the connection task and wait for it to stop delivering
	/// events. Bounded by `stop_timeout`; the task is force-aborted on
	/// overrun. Idempotent.
	pub async fn disconnect(&self) {
		self.cancel.cancel();
		let handle = self.task.lock().await.take();
		if let Some(handle) = handle {
			let abort = handle.abort_handle();
			if timeout(self.config.stop_timeout, handle).await.is_err() {
				warn!("Relay task for {} did not stop in time, aborting", self.url);
				abort.abort();
			}
		}
		*self.state.write().unwrap_or_else(|e| e.into_inner()) = RelayState::Disconnected;
	}
}

fn set_state(state: &Arc<RwLock<RelayState>>, value: RelayState) {
	*state.write().unwrap_or_else(|e| e.into_inner()) = value;
}

async fn run_connection(
	url: String,
	codec: Arc<NwcCodec>,
	incoming_tx: mpsc::UnboundedSender<RelayIncoming>,
	mut outbound_rx: mpsc::UnboundedReceiver<Event>,
	state: Arc<RwLock<RelayState>>,
	cancel: CancellationToken,
	config: RelayConfig,
) {
	let mut backoff = ExponentialBackoff {
		initial_interval: config.initial_backoff,
		max_interval: config.max_backoff,
		max_elapsed_time: None,
		..ExponentialBackoff::default()
	};

	loop {
		if cancel.is_cancelled() {
			break;
		}

		set_state(&state, RelayState::Connecting);
		debug!("Connecting to relay: {}", url);

		let connected = tokio::select! {
			_ = cancel.cancelled() => break,
			result = timeout(config.connect_timeout, connect_async(url.as_str())) => result,
		};

		match connected {
			Ok(Ok((mut ws, _response))) => {
				set_state(&state, RelayState::Connected);
				info!("Connected to relay: {}", url);

				// Requests queued while the socket was down are stale,
				// drop them before subscribing.
				while outbound_rx.try_recv().is_ok() {}

				let sub_id = subscription_id();
				let req = json!(["REQ", sub_id, codec.subscription_filter()]).to_string();
				if let Err(e) = ws.send(Message::Text(req)).await {
					warn!("Subscribe failed on {}: {}", url, e);
				} else {
					set_state(&state, RelayState::Subscribed);
					debug!("Subscribed on {} with id {}", url, sub_id);
					backoff.reset();

					read_loop(
						&url,
						&codec,
						&incoming_tx,
						&mut outbound_rx,
						&mut ws,
						&cancel,
					)
					.await;
				}

				let _ = ws.close(None).await;
			}
			Ok(Err(e)) => {
				warn!("Connection to {} failed: {}", url, e);
			}
			Err(_) => {
				warn!(
					"Connection to {} timed out after {:?}",
					url, config.connect_timeout
				);
			}
		}

		set_state(&state, RelayState::Disconnected);
		if cancel.is_cancelled() {
			break;
		}

		let delay = backoff.next_backoff().unwrap_or(config.max_backoff);
		debug!("Retrying {} in {:?}", url, delay);
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep(delay) => {}
		}
	}

	set_state(&state, RelayState::Disconnected);
	debug!("Relay task for {} stopped", url);
}

/// Pump the socket until it errors, closes, or the connection is cancelled.
async fn read_loop(
	url: &str,
	codec: &NwcCodec,
	incoming_tx: &mpsc::UnboundedSender<RelayIncoming>,
	outbound_rx: &mut mpsc::UnboundedReceiver<Event>,
	ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
	      + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
	      + Unpin),
	cancel: &CancellationToken,
) {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return,
			outbound = outbound_rx.recv() => {
				let Some(event) = outbound else { return };
				let frame = json!(["EVENT", event]).to_string();
				if let Err(e) = ws.send(Message::Text(frame)).await {
					warn!("Send to {} failed: {}", url, e);
					return;
				}
			}
			frame = ws.next() => {
				match frame {
					Some(Ok(Message::Text(text))) => {
						handle_frame(url, codec, incoming_tx, &text);
					}
					Some(Ok(Message::Ping(data))) => {
						if ws.send(Message::Pong(data)).await.is_err() {
							return;
						}
					}
					Some(Ok(Message::Close(_))) => {
						info!("Relay {} closed connection", url);
						return;
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						warn!("WebSocket error from {}: {}", url, e);
						return;
					}
					None => return,
				}
			}
		}
	}
}

fn handle_frame(
	url: &str,
	codec: &NwcCodec,
	incoming_tx: &mpsc::UnboundedSender<RelayIncoming>,
	text: &str,
) {
	match parse_relay_message(text) {
		Some(RelayMessage::Event(_sub_id, event)) => match codec.decode(&event) {
			Ok(incoming) => {
				let _ = incoming_tx.send((url.to_string(), incoming));
			}
			Err(e) => {
				// Non-fatal by design: drop the event and keep reading.
				debug!("Dropping undecodable event from {}: {}", url, e);
			}
		},
		Some(RelayMessage::Eose(sub_id)) => {
			debug!("EOSE from {} for {}", url, sub_id);
		}
		Some(RelayMessage::Notice(message)) => {
			warn!("Notice from {}: {}", url, message);
		}
		Some(RelayMessage::Ok(event_id, accepted, message)) => {
			if !accepted {
				warn!("Relay {} rejected event {}: {}", url, event_id, message);
			}
		}
		None => {
			debug!("Ignoring unparseable frame from {}", url);
		}
	}
}

/// Wire messages a relay sends to clients.
#[derive(Debug)]
enum RelayMessage {
	/// `["EVENT", subscription_id, event]`
	Event(String, Event),
	/// `["EOSE", subscription_id]`
	Eose(String),
	/// `["NOTICE", message]`
	Notice(String),
	/// `["OK", event_id, accepted, message]`
	Ok(String, bool, String),
}

fn parse_relay_message(text: &str) -> Option<RelayMessage> {
	let value: Value = serde_json::from_str(text).ok()?;
	let arr = value.as_array()?;
	match arr.first()?.as_str()? {
		"EVENT" => {
			let sub_id = arr.get(1)?.as_str()?.to_string();
			let event: Event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
			Some(RelayMessage::Event(sub_id, event))
		}
		"EOSE" => Some(RelayMessage::Eose(arr.get(1)?.as_str()?.to_string())),
		"NOTICE" => Some(RelayMessage::Notice(arr.get(1)?.as_str()?.to_string())),
		"OK" => Some(RelayMessage::Ok(
			arr.get(1)?.as_str()?.to_string(),
			arr.get(2)?.as_bool()?,
			arr.get(3).and_then(|m| m.as_str()).unwrap_or_default().to_string(),
		)),
		other => {
			debug!("Unknown relay message type: {}", other);
			None
		}
	}
}

fn subscription_id() -> String {
	let mut bytes = [0u8; 8];
	rand::rng().fill(&mut bytes);
	format!("walletsync-{}", hex::encode(bytes))
}
