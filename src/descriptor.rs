//! Connection descriptor parsing.
//!
//! A backend is constructed from one of two descriptor shapes: a Nostr
//! Wallet Connect URI carrying the wallet service pubkey, one or more relay
//! URLs and the client secret, or a `(base_url, api_key)` pair for a
//! custodial HTTP wallet service.

use crate::error::WalletError;
use url::Url;

pub const NWC_SCHEME: &str = "nostr+walletconnect";

/// Parsed `nostr+walletconnect://` URI.
#[derive(Debug, Clone)]
pub struct NwcUri {
	/// Wallet service public key, 64 lowercase hex chars (x-only).
	pub wallet_pubkey: String,
	/// Relay URLs in the order they appeared; duplicates are kept.
	pub relays: Vec<String>,
	/// Client secret key, 64 hex chars.
	pub secret: String,
	/// Optional static Lightning address (lud16).
	pub lud16: Option<String>,
}

/// One of the two supported backend descriptors.
#[derive(Debug, Clone)]
pub enum ConnectionDescriptor {
	Nwc(NwcUri),
	Custodial { base_url: String, api_key: String },
}

impl ConnectionDescriptor {
	pub fn nwc(uri: &str) -> Result<Self, WalletError> {
		Ok(ConnectionDescriptor::Nwc(NwcUri::parse(uri)?))
	}

	pub fn custodial(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
		ConnectionDescriptor::Custodial {
			base_url: base_url.into(),
			api_key: api_key.into(),
		}
	}
}

fn is_hex_key(s: &str) -> bool {
	s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl NwcUri {
	/// Parse a `nostr+walletconnect://<pubkey>?relay=..&secret=..[&lud16=..]`
	/// URI. The scheme match is case-sensitive; repeated `relay` parameters
	/// accumulate in order.
	pub fn parse(uri: &str) -> Result<Self, WalletError> {
		// Url lowercases the scheme, so check it on the raw string first.
		if !uri.starts_with(&format!("{}://", NWC_SCHEME)) {
			return Err(WalletError::Descriptor(format!(
				"expected {}:// URI",
				NWC_SCHEME
			)));
		}

		let url = Url::parse(uri)
			.map_err(|e| WalletError::Descriptor(format!("malformed URI: {}", e)))?;

		let wallet_pubkey = url
			.host_str()
			.unwrap_or_default()
			.to_ascii_lowercase();
		if !is_hex_key(&wallet_pubkey) {
			return Err(WalletError::Descriptor(
				"wallet pubkey must be 64 hex characters".to_string(),
			));
		}

		let mut relays = Vec::new();
		let mut secret = None;
		let mut lud16 = None;
		for (key, value) in url.query_pairs() {
			match key.as_ref() {
				"relay" => relays.push(value.into_owned()),
				"secret" => secret = Some(value.into_owned()),
				"lud16" => lud16 = Some(value.into_owned()),
				other => {
					tracing::debug!("Ignoring unknown NWC URI parameter: {}", other);
				}
			}
		}

		if relays.is_empty() {
			return Err(WalletError::Descriptor(
				"at least one relay parameter is required".to_string(),
			));
		}

		let secret = secret.ok_or_else(|| {
			WalletError::Descriptor("secret parameter is required".to_string())
		})?;
		if !is_hex_key(&secret) {
			return Err(WalletError::Descriptor(
				"secret must be 64 hex characters".to_string(),
			));
		}

		Ok(Self {
			wallet_pubkey,
			relays,
			secret,
			lud16,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PUBKEY: &str = "e46762afab282c324278351165122345f9983ea447b47943b052100321227571";
	const SECRET: &str = "fab0a9a11d4cf4b1d92e901a0b2c56634275e2fa1a7eb396ff1b942f95d59fd3";

	#[test]
	fn parses_multiple_relays_in_order_with_duplicates() {
		let uri = format!(
			"{}://{}?relay=wss://a.example/ws&relay=wss://b.example&relay=wss://a.example/ws&secret={}",
			NWC_SCHEME, PUBKEY, SECRET
		);
		let parsed = NwcUri::parse(&uri).unwrap();
		assert_eq!(parsed.wallet_pubkey, PUBKEY);
		assert_eq!(
			parsed.relays,
			vec![
				"wss://a.example/ws".to_string(),
				"wss://b.example".to_string(),
				"wss://a.example/ws".to_string(),
			]
		);
		assert!(parsed.lud16.is_none());
	}

	#[test]
	fn parses_lud16() {
		let uri = format!(
			"{}://{}?relay=ws://127.0.0.1:5000/nostrrelay/test&secret={}&lud16=test@example.com",
			NWC_SCHEME, PUBKEY, SECRET
		);
		let parsed = NwcUri::parse(&uri).unwrap();
		assert_eq!(parsed.lud16.as_deref(), Some("test@example.com"));
	}

	#[test]
	fn missing_secret_is_a_descriptor_error() {
		let uri = format!("{}://{}?relay=wss://a.example", NWC_SCHEME, PUBKEY);
		match NwcUri::parse(&uri) {
			Err(WalletError::Descriptor(_)) => {}
			other => panic!("expected Descriptor error, got {:?}", other),
		}
	}

	#[test]
	fn missing_relay_is_a_descriptor_error() {
		let uri = format!("{}://{}?secret={}", NWC_SCHEME, PUBKEY, SECRET);
		assert!(matches!(
			NwcUri::parse(&uri),
			Err(WalletError::Descriptor(_))
		));
	}

	#[test]
	fn malformed_pubkey_is_a_descriptor_error() {
		let uri = format!(
			"{}://nothex?relay=wss://a.example&secret={}",
			NWC_SCHEME, SECRET
		);
		assert!(matches!(
			NwcUri::parse(&uri),
			Err(WalletError::Descriptor(_))
		));
	}

	#[test]
	fn scheme_is_case_sensitive() {
		let uri = format!(
			"NOSTR+WALLETCONNECT://{}?relay=wss://a.example&secret={}",
			PUBKEY, SECRET
		);
		assert!(matches!(
			NwcUri::parse(&uri),
			Err(WalletError::Descriptor(_))
		));
	}
}
