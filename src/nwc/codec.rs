//! NIP-47 wire codec.
//!
//! Transforms logical wallet requests (`get_balance`, `list_transactions`,
//! `make_invoice`) into encrypted, signed Nostr events and decodes inbound
//! events back into responses or push notifications. Payloads are encrypted
//! with NIP-04 (AES-256-CBC under the ECDH shared secret); the envelope is a
//! BIP-340 Schnorr-signed event. A response is matched to its request solely
//! by the request event id carried in the response's `e` tag.

use crate::descriptor::NwcUri;
use crate::error::WalletError;
use crate::ledger::Payment;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use secp256k1::{Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey, ecdh};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// NIP-47 request event kind.
pub const KIND_NWC_REQUEST: u16 = 23194;
/// NIP-47 response event kind.
pub const KIND_NWC_RESPONSE: u16 = 23195;
/// NIP-47 notification event kind.
pub const KIND_NWC_NOTIFICATION: u16 = 23196;

/// A signed Nostr event as it travels over the relay socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub id: String,
	pub pubkey: String,
	pub created_at: u64,
	pub kind: u16,
	pub tags: Vec<Vec<String>>,
	pub content: String,
	pub sig: String,
}

impl Event {
	/// First value of the named tag, if present.
	pub fn tag_value(&self, name: &str) -> Option<&str> {
		self.tags
			.iter()
			.find(|t| t.first().map(String::as_str) == Some(name))
			.and_then(|t| t.get(1))
			.map(String::as_str)
	}
}

/// A decoded response to an earlier request.
#[derive(Debug, Clone)]
pub struct NwcResponse {
	/// Correlation identifier: the id of the request event this answers.
	pub request_id: String,
	pub result_type: String,
	/// Error reported by the wallet service, if any.
	pub error: Option<String>,
	pub result: Value,
}

/// An unsolicited push notification from the wallet service.
#[derive(Debug, Clone)]
pub struct NwcNotification {
	pub notification_type: String,
	pub payload: Value,
}

/// Either side of the decoded inbound stream.
#[derive(Debug, Clone)]
pub enum Incoming {
	Response(NwcResponse),
	Notification(NwcNotification),
}

/// Per-session codec: client keypair, wallet service pubkey and the NIP-04
/// shared secret derived from them.
pub struct NwcCodec {
	secp: Secp256k1<secp256k1::All>,
	keypair: Keypair,
	client_pubkey: String,
	wallet_pubkey: XOnlyPublicKey,
	wallet_pubkey_hex: String,
	shared_secret: [u8; 32],
}

impl NwcCodec {
	pub fn new(uri: &NwcUri) -> Result<Self, WalletError> {
		let secp = Secp256k1::new();

		let secret_bytes = hex::decode(&uri.secret)
			.map_err(|e| WalletError::Descriptor(format!("secret is not valid hex: {}", e)))?;
		let secret_key = SecretKey::from_slice(&secret_bytes)
			.map_err(|e| WalletError::Descriptor(format!("invalid secret key: {}", e)))?;
		let keypair = Keypair::from_secret_key(&secp, &secret_key);
		let client_pubkey = hex::encode(keypair.x_only_public_key().0.serialize());

		let wallet_bytes = hex::decode(&uri.wallet_pubkey)
			.map_err(|e| WalletError::Descriptor(format!("pubkey is not valid hex: {}", e)))?;
		let wallet_pubkey = XOnlyPublicKey::from_slice(&wallet_bytes)
			.map_err(|e| WalletError::Descriptor(format!("invalid wallet pubkey: {}", e)))?;

		// NIP-04 shared secret: the x coordinate of the ECDH point, unhashed.
		// Parity of the wallet key does not matter, negation only flips y.
		let full_wallet_key = PublicKey::from_x_only_public_key(wallet_pubkey, Parity::Even);
		let point = ecdh::shared_secret_point(&full_wallet_key, &secret_key);
		let mut shared_secret = [0u8; 32];
		shared_secret.copy_from_slice(&point[..32]);

		Ok(Self {
			secp,
			keypair,
			client_pubkey,
			wallet_pubkey,
			wallet_pubkey_hex: uri.wallet_pubkey.clone(),
			shared_secret,
		})
	}

	/// Hex x-only pubkey the wallet service addresses us by.
	pub fn client_pubkey(&self) -> &str {
		&self.client_pubkey
	}

	/// Subscription filter matching responses and notifications addressed to
	/// this client.
	pub fn subscription_filter(&self) -> Value {
		json!({
			"kinds": [KIND_NWC_RESPONSE, KIND_NWC_NOTIFICATION],
			"authors": [self.wallet_pubkey_hex],
			"#p": [self.client_pubkey],
		})
	}

	/// Build a signed request event. The returned event's `id` is the
	/// correlation identifier responses will carry in their `e` tag.
	pub fn request(&self, method: &str, params: Value) -> Result<Event, WalletError> {
		let payload = json!({ "method": method, "params": params });
		let tags = vec![vec!["p".to_string(), self.wallet_pubkey_hex.clone()]];
		self.encode(KIND_NWC_REQUEST, tags, &payload)
	}

	/// Encrypt and sign an arbitrary payload into an event of the given
	/// kind. `request` covers the client side; wallet-service
	/// implementations and test doubles use this for responses and
	/// notifications.
	pub fn encode(
		&self,
		kind: u16,
		tags: Vec<Vec<String>>,
		payload: &Value,
	) -> Result<Event, WalletError> {
		let content = self.nip04_encrypt(&payload.to_string());
		let created_at = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		self.sign_event(kind, tags, content, created_at)
	}

	fn sign_event(
		&self,
		kind: u16,
		tags: Vec<Vec<String>>,
		content: String,
		created_at: u64,
	) -> Result<Event, WalletError> {
		let pubkey = self.client_pubkey.clone();
		let id_bytes = event_id(&pubkey, created_at, kind, &tags, &content)?;
		let msg = Message::from_digest(id_bytes);
		let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
		Ok(Event {
			id: hex::encode(id_bytes),
			pubkey,
			created_at,
			kind,
			tags,
			content,
			sig: hex::encode(sig.as_ref()),
		})
	}

	/// Decode an inbound event into a response or notification.
	///
	/// Any failure here (wrong author, bad id or signature, undecryptable or
	/// malformed payload) is a protocol error: callers drop the event and
	/// log, they never surface it through the error callback.
	pub fn decode(&self, event: &Event) -> Result<Incoming, WalletError> {
		if event.pubkey != self.wallet_pubkey_hex {
			return Err(WalletError::Protocol(format!(
				"event from unexpected author {}",
				event.pubkey
			)));
		}

		let id_bytes = event_id(
			&event.pubkey,
			event.created_at,
			event.kind,
			&event.tags,
			&event.content,
		)?;
		if hex::encode(id_bytes) != event.id {
			return Err(WalletError::Protocol("event id mismatch".to_string()));
		}

		let sig_bytes = hex::decode(&event.sig)
			.map_err(|e| WalletError::Protocol(format!("signature is not hex: {}", e)))?;
		let sig = secp256k1::schnorr::Signature::from_slice(&sig_bytes)
			.map_err(|e| WalletError::Protocol(format!("malformed signature: {}", e)))?;
		let msg = Message::from_digest(id_bytes);
		self.secp
			.verify_schnorr(&sig, &msg, &self.wallet_pubkey)
			.map_err(|e| WalletError::Protocol(format!("bad signature: {}", e)))?;

		let plaintext = self.nip04_decrypt(&event.content)?;
		let payload: Value = serde_json::from_str(&plaintext)?;

		match event.kind {
			KIND_NWC_RESPONSE => {
				let request_id = event
					.tag_value("e")
					.ok_or_else(|| {
						WalletError::Protocol("response without e tag".to_string())
					})?
					.to_string();
				let result_type = payload["result_type"]
					.as_str()
					.unwrap_or_default()
					.to_string();
				let error = payload["error"]["message"].as_str().map(str::to_string);
				Ok(Incoming::Response(NwcResponse {
					request_id,
					result_type,
					error,
					result: payload["result"].clone(),
				}))
			}
			KIND_NWC_NOTIFICATION => {
				let notification_type = payload["notification_type"]
					.as_str()
					.unwrap_or_default()
					.to_string();
				Ok(Incoming::Notification(NwcNotification {
					notification_type,
					payload: payload["notification"].clone(),
				}))
			}
			other => Err(WalletError::Protocol(format!(
				"unexpected event kind {}",
				other
			))),
		}
	}

	fn nip04_encrypt(&self, plaintext: &str) -> String {
		let mut iv = [0u8; 16];
		rand::rng().fill(&mut iv);
		let cipher = Aes256CbcEnc::new((&self.shared_secret).into(), (&iv).into());
		let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
		format!("{}?iv={}", BASE64.encode(ciphertext), BASE64.encode(iv))
	}

	fn nip04_decrypt(&self, content: &str) -> Result<String, WalletError> {
		let (data_b64, iv_b64) = content
			.split_once("?iv=")
			.ok_or_else(|| WalletError::Protocol("payload missing iv".to_string()))?;
		let ciphertext = BASE64
			.decode(data_b64)
			.map_err(|e| WalletError::Protocol(format!("payload is not base64: {}", e)))?;
		let iv_bytes = BASE64
			.decode(iv_b64)
			.map_err(|e| WalletError::Protocol(format!("iv is not base64: {}", e)))?;
		let iv: [u8; 16] = iv_bytes
			.try_into()
			.map_err(|_| WalletError::Protocol("iv must be 16 bytes".to_string()))?;
		let cipher = Aes256CbcDec::new((&self.shared_secret).into(), (&iv).into());
		let plaintext = cipher
			.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
			.map_err(|e| WalletError::Protocol(format!("decryption failed: {}", e)))?;
		String::from_utf8(plaintext)
			.map_err(|e| WalletError::Protocol(format!("payload is not utf-8: {}", e)))
	}
}

/// Canonical NIP-01 event id: sha256 of the serialized
/// `[0, pubkey, created_at, kind, tags, content]` array.
fn event_id(
	pubkey: &str,
	created_at: u64,
	kind: u16,
	tags: &[Vec<String>],
	content: &str,
) -> Result<[u8; 32], WalletError> {
	let serialized = serde_json::to_string(&json!([0, pubkey, created_at, kind, tags, content]))?;
	let digest = Sha256::digest(serialized.as_bytes());
	Ok(digest.into())
}

/// Convert one NIP-47 transaction object into a ledger payment.
///
/// Amounts are in millisats on the wire; the ledger keeps integer sats,
/// signed by direction. Unsettled entries and unparseable objects yield
/// `None` and are skipped.
pub fn payment_from_transaction(tx: &Value) -> Option<Payment> {
	let amount_msat = tx["amount"].as_i64()?;
	let epoch_time = tx["settled_at"]
		.as_i64()
		.or_else(|| tx["created_at"].as_i64())?;
	let sats = amount_msat / 1000;
	let amount_sats = match tx["type"].as_str()? {
		"incoming" => sats,
		"outgoing" => -sats,
		_ => return None,
	};
	let comment = tx["description"].as_str().unwrap_or_default().to_string();
	Some(Payment::new(epoch_time, amount_sats, comment))
}

/// Extract the balance in sats from a `get_balance` result (wire value is
/// millisats).
pub fn balance_sats(result: &Value) -> Option<i64> {
	result["balance"].as_i64().map(|msat| msat / 1000)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::NwcUri;

	const CLIENT_SECRET: &str =
		"fab0a9a11d4cf4b1d92e901a0b2c56634275e2fa1a7eb396ff1b942f95d59fd3";
	const WALLET_SECRET: &str =
		"2e347e236daa04faad881f1dc5dc3b8a9b4e8e4429e9d0728aad78ada199b66b";

	fn xonly_hex(secret_hex: &str) -> String {
		let secp = Secp256k1::new();
		let sk = SecretKey::from_slice(&hex::decode(secret_hex).unwrap()).unwrap();
		let kp = Keypair::from_secret_key(&secp, &sk);
		hex::encode(kp.x_only_public_key().0.serialize())
	}

	fn client_codec() -> NwcCodec {
		let uri = NwcUri {
			wallet_pubkey: xonly_hex(WALLET_SECRET),
			relays: vec!["wss://relay.example".to_string()],
			secret: CLIENT_SECRET.to_string(),
			lud16: None,
		};
		NwcCodec::new(&uri).unwrap()
	}

	/// Codec playing the wallet service side: same shared secret, signs with
	/// the wallet key, addresses the client.
	fn wallet_codec() -> NwcCodec {
		let uri = NwcUri {
			wallet_pubkey: xonly_hex(CLIENT_SECRET),
			relays: vec!["wss://relay.example".to_string()],
			secret: WALLET_SECRET.to_string(),
			lud16: None,
		};
		NwcCodec::new(&uri).unwrap()
	}

	fn wallet_event(kind: u16, tags: Vec<Vec<String>>, payload: Value) -> Event {
		let wallet = wallet_codec();
		let content = wallet.nip04_encrypt(&payload.to_string());
		wallet.sign_event(kind, tags, content, 1700000000).unwrap()
	}

	#[test]
	fn shared_secret_is_symmetric() {
		assert_eq!(client_codec().shared_secret, wallet_codec().shared_secret);
	}

	#[test]
	fn request_carries_p_tag_and_verifies() {
		let codec = client_codec();
		let event = codec.request("get_balance", json!({})).unwrap();
		assert_eq!(event.kind, KIND_NWC_REQUEST);
		assert_eq!(event.tag_value("p"), Some(xonly_hex(WALLET_SECRET).as_str()));

		let id = event_id(
			&event.pubkey,
			event.created_at,
			event.kind,
			&event.tags,
			&event.content,
		)
		.unwrap();
		assert_eq!(hex::encode(id), event.id);

		let secp = Secp256k1::new();
		let sig = secp256k1::schnorr::Signature::from_slice(&hex::decode(&event.sig).unwrap())
			.unwrap();
		let pk = XOnlyPublicKey::from_slice(&hex::decode(&event.pubkey).unwrap()).unwrap();
		secp.verify_schnorr(&sig, &Message::from_digest(id), &pk)
			.unwrap();
	}

	#[test]
	fn nip04_round_trip() {
		let codec = client_codec();
		let ciphertext = codec.nip04_encrypt("{\"method\":\"get_balance\"}");
		assert!(ciphertext.contains("?iv="));
		let plaintext = wallet_codec().nip04_decrypt(&ciphertext).unwrap();
		assert_eq!(plaintext, "{\"method\":\"get_balance\"}");
	}

	#[test]
	fn decodes_response_with_correlation_id() {
		let event = wallet_event(
			KIND_NWC_RESPONSE,
			vec![
				vec!["p".to_string(), xonly_hex(CLIENT_SECRET)],
				vec!["e".to_string(), "req123".to_string()],
			],
			json!({
				"result_type": "get_balance",
				"result": { "balance": 21000 },
			}),
		);
		match client_codec().decode(&event).unwrap() {
			Incoming::Response(resp) => {
				assert_eq!(resp.request_id, "req123");
				assert_eq!(resp.result_type, "get_balance");
				assert!(resp.error.is_none());
				assert_eq!(balance_sats(&resp.result), Some(21));
			}
			other => panic!("expected response, got {:?}", other),
		}
	}

	#[test]
	fn decodes_notification() {
		let event = wallet_event(
			KIND_NWC_NOTIFICATION,
			vec![vec!["p".to_string(), xonly_hex(CLIENT_SECRET)]],
			json!({
				"notification_type": "payment_received",
				"notification": {
					"type": "incoming",
					"amount": 5000,
					"settled_at": 1700000123,
					"description": "zap",
				},
			}),
		);
		match client_codec().decode(&event).unwrap() {
			Incoming::Notification(n) => {
				assert_eq!(n.notification_type, "payment_received");
				let payment = payment_from_transaction(&n.payload).unwrap();
				assert_eq!(payment, Payment::new(1700000123, 5, "zap"));
			}
			other => panic!("expected notification, got {:?}", other),
		}
	}

	#[test]
	fn tampered_event_is_a_protocol_error() {
		let mut event = wallet_event(
			KIND_NWC_RESPONSE,
			vec![vec!["e".to_string(), "req123".to_string()]],
			json!({ "result_type": "get_balance", "result": {} }),
		);
		event.content.push('x');
		assert!(matches!(
			client_codec().decode(&event),
			Err(WalletError::Protocol(_))
		));
	}

	#[test]
	fn event_from_wrong_author_is_rejected() {
		// Signed by the client key instead of the wallet key.
		let codec = client_codec();
		let event = codec.request("get_balance", json!({})).unwrap();
		assert!(matches!(
			codec.decode(&event),
			Err(WalletError::Protocol(_))
		));
	}

	#[test]
	fn payment_mapping_signs_by_direction() {
		let incoming = json!({
			"type": "incoming", "amount": 1500, "settled_at": 10, "description": ""
		});
		let outgoing = json!({
			"type": "outgoing", "amount": 2000, "settled_at": 11, "description": "lunch"
		});
		assert_eq!(
			payment_from_transaction(&incoming).unwrap(),
			Payment::new(10, 1, "")
		);
		assert_eq!(
			payment_from_transaction(&outgoing).unwrap(),
			Payment::new(11, -2, "lunch")
		);
		assert!(payment_from_transaction(&json!({"type": "sideways"})).is_none());
	}
}
