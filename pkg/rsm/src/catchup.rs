use super::protos::*;

use std::collections::HashMap;
use std::time::Instant;

/// Requests to the external catchup engine, emitted through the Tick. The engine owns the
/// actual transfer; results come back through Proposer::catchup_callback with the same
/// monitor ref as any other agent response
pub enum CatchupAction {
	/// Bring up an engine scoped to this proposer's (history, term)
	Start,

	/// Transfer the log prefix below from_seqno (from a snapshot if necessary) to a peer
	/// whose gap is too old for incremental appends
	Transfer { peer: Peer, mon_ref: MonRef, from_seqno: Seqno },

	Cancel { peer: Peer },

	Stop
}

/// Per-peer retry bookkeeping for failed transfers. A failed catchup is retried only once
/// its backoff deadline has passed
pub struct CatchupTracker {
	retry_at: HashMap<Peer, Instant>
}

impl CatchupTracker {
	pub fn new() -> CatchupTracker {
		CatchupTracker { retry_at: HashMap::new() }
	}

	pub fn note_failure(&mut self, peer: &Peer, retry_at: Instant) {
		self.retry_at.insert(peer.clone(), retry_at);
	}

	/// Whether a transfer to this peer may be dispatched at the given time
	pub fn ready(&self, peer: &Peer, now: Instant) -> bool {
		match self.retry_at.get(peer) {
			Some(at) => now >= *at,
			None => true
		}
	}

	pub fn clear(&mut self, peer: &Peer) {
		self.retry_at.remove(peer);
	}

	/// Earliest pending retry deadline, for arming the next timer
	pub fn next_deadline(&self) -> Option<Instant> {
		self.retry_at.values().min().cloned()
	}
}
