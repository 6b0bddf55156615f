//! In-memory payment ledger.
//!
//! `Payment` is an immutable record of one ledger event with structural
//! equality and a total order. `PaymentLedger` keeps unique payments sorted
//! in descending order (most recent logical event first), so the UI can
//! render it top-down without sorting.

use std::fmt;

/// One settled ledger event, in integer satoshis.
///
/// Positive `amount_sats` means received, negative means sent. The total
/// order is lexicographic on `(epoch_time, amount_sats, comment)`, which is
/// what the ledger uses for ranking and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payment {
	pub epoch_time: i64,
	pub amount_sats: i64,
	pub comment: String,
}

impl Payment {
	pub fn new(epoch_time: i64, amount_sats: i64, comment: impl Into<String>) -> Self {
		Self {
			epoch_time,
			amount_sats,
			comment: comment.into(),
		}
	}
}

impl fmt::Display for Payment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let unit = if self.amount_sats == 1 { "sat" } else { "sats" };
		if self.comment.is_empty() {
			let verb = if self.amount_sats > 0 {
				"received!"
			} else {
				"spent"
			};
			write!(f, "{} {} {}", self.amount_sats, unit, verb)
		} else {
			write!(f, "{} {}: {}", self.amount_sats, unit, self.comment)
		}
	}
}

/// A deduplicated list of payments, sorted descending at all times.
///
/// Both backends feed this from synchronization responses and push
/// notifications, which may arrive duplicated or out of order; `add` keeps
/// the invariants without a full re-sort.
#[derive(Debug, Clone, Default)]
pub struct PaymentLedger {
	items: Vec<Payment>,
}

impl PaymentLedger {
	pub fn new() -> Self {
		Self { items: Vec::new() }
	}

	/// Insert a payment at its descending rank unless an equal payment is
	/// already present. Returns whether the ledger changed, so callers can
	/// suppress no-op update callbacks.
	pub fn add(&mut self, payment: Payment) -> bool {
		if self.items.contains(&payment) {
			return false;
		}
		// Forward scan: the first existing item the new one outranks marks
		// the insertion point for descending order.
		for (i, existing) in self.items.iter().enumerate() {
			if payment > *existing {
				self.items.insert(i, payment);
				return true;
			}
		}
		self.items.push(payment);
		true
	}

	pub fn get(&self, index: usize) -> Option<&Payment> {
		self.items.get(index)
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Payment> {
		self.items.iter()
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn clear(&mut self) {
		self.items.clear();
	}
}

impl PartialEq for PaymentLedger {
	fn eq(&self, other: &Self) -> bool {
		self.items.len() == other.items.len()
			&& self.items.iter().zip(other.items.iter()).all(|(a, b)| a == b)
	}
}

impl Eq for PaymentLedger {}

impl<'a> IntoIterator for &'a PaymentLedger {
	type Item = &'a Payment;
	type IntoIter = std::slice::Iter<'a, Payment>;

	fn into_iter(self) -> Self::IntoIter {
		self.items.iter()
	}
}

impl fmt::Display for PaymentLedger {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for item in &self.items {
			if !first {
				writeln!(f)?;
			}
			write!(f, "{}", item)?;
			first = false;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn payment_equality_is_structural() {
		let a = Payment::new(1700000000, 21, "coffee");
		let b = Payment::new(1700000000, 21, "coffee");
		assert_eq!(a, b);
		assert_ne!(a, Payment::new(1700000001, 21, "coffee"));
		assert_ne!(a, Payment::new(1700000000, 22, "coffee"));
		assert_ne!(a, Payment::new(1700000000, 21, "tea"));
	}

	#[test]
	fn payment_order_is_lexicographic() {
		let older = Payment::new(100, 5, "a");
		let newer = Payment::new(200, -5, "");
		assert!(newer > older);
		// Same timestamp: amount breaks the tie, then comment.
		assert!(Payment::new(100, 6, "") > Payment::new(100, 5, "z"));
		assert!(Payment::new(100, 5, "b") > Payment::new(100, 5, "a"));
	}

	#[test]
	fn ledger_sorts_descending_regardless_of_insertion_order() {
		let payments = [
			Payment::new(300, 10, ""),
			Payment::new(100, -4, "lunch"),
			Payment::new(200, 7, "tip"),
			Payment::new(200, 3, ""),
		];
		let mut forward = PaymentLedger::new();
		let mut reverse = PaymentLedger::new();
		for p in payments.iter() {
			forward.add(p.clone());
		}
		for p in payments.iter().rev() {
			reverse.add(p.clone());
		}
		assert_eq!(forward, reverse);
		let times: Vec<i64> = forward.iter().map(|p| p.epoch_time).collect();
		assert_eq!(times, vec![300, 200, 200, 100]);
		assert_eq!(forward.get(1).unwrap().amount_sats, 7);
	}

	#[test]
	fn ledger_deduplicates_and_reinsertion_is_idempotent() {
		let mut ledger = PaymentLedger::new();
		let p = Payment::new(100, 5, "again");
		assert!(ledger.add(p.clone()));
		assert!(!ledger.add(p.clone()));
		assert!(!ledger.add(p));
		assert_eq!(ledger.len(), 1);
	}

	#[test]
	fn ledger_equality_is_elementwise() {
		let mut a = PaymentLedger::new();
		let mut b = PaymentLedger::new();
		assert_eq!(a, b);
		a.add(Payment::new(1, 1, ""));
		assert_ne!(a, b);
		b.add(Payment::new(1, 1, ""));
		assert_eq!(a, b);
		a.add(Payment::new(2, 2, "x"));
		b.add(Payment::new(2, 2, "y"));
		assert_ne!(a, b);
	}

	#[test]
	fn display_renders_verb_or_comment() {
		assert_eq!(Payment::new(0, 21, "").to_string(), "21 sats received!");
		assert_eq!(Payment::new(0, -3, "").to_string(), "-3 sats spent");
		assert_eq!(Payment::new(0, 1, "zap").to_string(), "1 sat: zap");
	}
}
