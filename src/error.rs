/// Error taxonomy for wallet synchronization.
///
/// `Descriptor` and `State` are synchronous misuse errors returned directly
/// from the failing call. `Transport` and `FeatureUnavailable` travel through
/// the error callback. `Protocol` errors are dropped and logged where they
/// occur and never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
	#[error("invalid connection descriptor: {0}")]
	Descriptor(String),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("feature unavailable: {0}")]
	FeatureUnavailable(String),

	#[error("invalid state: {0}")]
	State(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for WalletError {
	fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
		WalletError::Transport(e.to_string())
	}
}

impl From<reqwest::Error> for WalletError {
	fn from(e: reqwest::Error) -> Self {
		WalletError::Transport(e.to_string())
	}
}

impl From<serde_json::Error> for WalletError {
	fn from(e: serde_json::Error) -> Self {
		WalletError::Protocol(e.to_string())
	}
}
