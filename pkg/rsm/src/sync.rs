use super::protos::*;

use std::collections::{HashMap, HashSet};

pub type SyncId = u64;

/// One outstanding sync-quorum (read barrier) call
/// The request is answered the moment its votes satisfy the quorum in force, or becomes
/// no_quorum as soon as the remaining peers can no longer provide one
pub struct SyncRequest {
	pub reply_to: ReplyTo,
	pub votes: HashSet<Peer>,
	pub failed_votes: HashSet<Peer>
}

pub struct SyncTable {
	next_id: SyncId,
	requests: HashMap<SyncId, SyncRequest>
}

impl SyncTable {
	pub fn new() -> SyncTable {
		SyncTable { next_id: 1, requests: HashMap::new() }
	}

	/// Registers a new request. The local vote is implied: being able to run this code at
	/// all means the local agent is still with us
	pub fn insert(&mut self, reply_to: ReplyTo, failed_votes: HashSet<Peer>) -> SyncId {
		let id = self.next_id;
		self.next_id += 1;

		let mut votes = HashSet::new();
		votes.insert(Peer::Local);

		self.requests.insert(id, SyncRequest { reply_to, votes, failed_votes });
		id
	}

	pub fn get_mut(&mut self, id: SyncId) -> Option<&mut SyncRequest> {
		self.requests.get_mut(&id)
	}

	pub fn remove(&mut self, id: SyncId) -> Option<SyncRequest> {
		self.requests.remove(&id)
	}

	pub fn ids(&self) -> Vec<SyncId> {
		self.requests.keys().cloned().collect()
	}

	pub fn is_empty(&self) -> bool {
		self.requests.is_empty()
	}

	/// Marks a peer as failed in every outstanding request that has not heard from it.
	/// Used when a peer's monitor goes down
	pub fn fail_peer(&mut self, peer: &Peer) {
		for req in self.requests.values_mut() {
			if !req.votes.contains(peer) {
				req.failed_votes.insert(peer.clone());
			}
		}
	}

	/// Drains everything, for proposer shutdown
	pub fn drain(&mut self) -> Vec<SyncRequest> {
		self.requests.drain().map(|(_, req)| req).collect()
	}
}
