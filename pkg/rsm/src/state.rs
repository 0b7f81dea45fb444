use super::catchup::CatchupTracker;
use super::protos::*;
use super::sync::SyncTable;

use std::cmp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

pub enum ProposerState {
	EstablishTerm(EstablishState),
	Proposing(ProposingState),
	Stopped(StopReason)
}

/// Why a proposer reached its terminal state
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
	/// Explicitly stopped by the server shell
	Stopped,

	/// The local node is not a voter of the effective configuration
	NotVoter,

	/// The election quorum can no longer be assembled
	NoQuorum,

	EstablishTimeout,

	/// Some agent has adopted a higher term; the shell should trigger a new election
	ConflictingTerm(Term),

	/// A branch happened that we have not ingested yet
	HistoryMismatch,

	LocalAgentDown,

	/// Our own removal from the configuration has committed
	LeaderRemoved,

	UnexpectedError(String)
}

pub struct EstablishState {
	/// Metadata of every peer that has voted so far, kept around so that peer statuses
	/// can be built once the quorum is reached
	pub votes: HashMap<Peer, Metadata>,

	pub failed_votes: HashSet<Peer>,

	pub deadline: Instant
}

pub struct ProposingState {
	pub syncs: SyncTable,

	pub next_check_peers: Instant,

	pub catchup: CatchupTracker,

	/// Reply handle of an accepted cas_config, resolved when the settled stable config
	/// commits
	pub cas_waiter: Option<ReplyTo>,

	/// Config requests received while the current config was uncommitted, replayed in
	/// FIFO order after the next config commit
	pub postponed: VecDeque<PostponedConfig>
}

pub enum PostponedConfig {
	Get(ReplyTo),
	Cas { reply_to: ReplyTo, new_config: ConfigData, expected: Revision }
}

/// Replication bookkeeping for one peer, owned by the proposer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
	/// An append must be dispatched even if there is nothing new to send, because the
	/// peer carries an uncommitted tail that has to be cut back
	pub needs_sync: bool,

	pub sent_seqno: Seqno,
	pub sent_commit_seqno: Seqno,

	pub acked_seqno: Seqno,
	pub acked_commit_seqno: Seqno,

	pub catchup_in_progress: bool
}

enum PeerSlot {
	/// A probe is in flight; suppresses duplicates until it resolves or the peer dies
	Requested,

	Ready(PeerStatus)
}

/// Table of per-peer replication statuses
/// Entries appear on the first successful contact with a peer and disappear when its
/// monitor goes down or the configuration drops it
pub struct PeerStatusTable {
	slots: HashMap<Peer, PeerSlot>
}

impl PeerStatusTable {
	pub fn new() -> PeerStatusTable {
		PeerStatusTable { slots: HashMap::new() }
	}

	/// Records that a probe was dispatched. Returns false if the peer already has a slot,
	/// in which case no new probe should be sent
	pub fn mark_requested(&mut self, peer: &Peer) -> bool {
		if self.slots.contains_key(peer) {
			return false;
		}

		self.slots.insert(peer.clone(), PeerSlot::Requested);
		true
	}

	/// Builds the initial status from the metadata a peer answered with. Must be called
	/// at most once per contact cycle
	///
	/// When the peer acknowledged our own term its log is a prefix of ours and its
	/// reported position can be used as-is. Otherwise the only prefix we can rely on is
	/// the peer's committed one: replication re-anchors there and the first append cuts
	/// back whatever uncommitted tail the peer still carries
	pub fn init(&mut self, peer: &Peer, meta: &Metadata, shared_history: bool, our_high: Seqno) {
		let status = if shared_history {
			let high = cmp::min(meta.high_seqno, our_high);
			let commit = cmp::min(meta.committed_seqno, high);

			PeerStatus {
				needs_sync: meta.high_seqno > our_high,
				sent_seqno: high,
				sent_commit_seqno: commit,
				acked_seqno: high,
				acked_commit_seqno: commit,
				catchup_in_progress: false
			}
		}
		else {
			PeerStatus {
				needs_sync: meta.high_seqno > meta.committed_seqno,
				sent_seqno: meta.committed_seqno,
				sent_commit_seqno: meta.committed_seqno,
				acked_seqno: meta.committed_seqno,
				acked_commit_seqno: meta.committed_seqno,
				catchup_in_progress: false
			}
		};

		self.slots.insert(peer.clone(), PeerSlot::Ready(status));
	}

	pub fn contains(&self, peer: &Peer) -> bool {
		self.slots.contains_key(peer)
	}

	pub fn get(&self, peer: &Peer) -> Option<&PeerStatus> {
		match self.slots.get(peer) {
			Some(PeerSlot::Ready(s)) => Some(s),
			_ => None
		}
	}

	pub fn get_mut(&mut self, peer: &Peer) -> Option<&mut PeerStatus> {
		match self.slots.get_mut(peer) {
			Some(PeerSlot::Ready(s)) => Some(s),
			_ => None
		}
	}

	pub fn set_sent(&mut self, peer: &Peer, seqno: Seqno, commit_seqno: Seqno) {
		let status = self.get_mut(peer).expect("set_sent for an uninitialized peer");

		assert!(seqno >= status.acked_seqno);
		assert!(commit_seqno >= status.acked_commit_seqno);

		status.sent_seqno = seqno;
		status.sent_commit_seqno = commit_seqno;

		// The advance is on its way now
		status.needs_sync = false;
	}

	pub fn set_acked(&mut self, peer: &Peer, seqno: Seqno, commit_seqno: Seqno) {
		let status = self.get_mut(peer).expect("set_acked for an uninitialized peer");

		assert!(seqno >= status.acked_seqno);
		assert!(commit_seqno >= status.acked_commit_seqno);
		assert!(status.sent_seqno >= seqno);
		assert!(status.sent_commit_seqno >= commit_seqno);

		status.acked_seqno = seqno;
		status.acked_commit_seqno = commit_seqno;
	}

	pub fn remove(&mut self, peer: &Peer) {
		self.slots.remove(peer);
	}

	/// Iterates fully initialized statuses only
	pub fn iter_ready(&self) -> impl Iterator<Item = (&Peer, &PeerStatus)> {
		self.slots.iter().filter_map(|(peer, slot)| {
			match slot {
				PeerSlot::Ready(s) => Some((peer, s)),
				PeerSlot::Requested => None
			}
		})
	}

	pub fn peers(&self) -> Vec<Peer> {
		self.slots.keys().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn meta(term_voted: Term, committed: Seqno, high: Seqno) -> Metadata {
		Metadata {
			peer: Peer::named("b"),
			history_id: "h".to_string(),
			term: term_voted.clone(),
			term_voted,
			high_seqno: high,
			committed_seqno: committed,
			config: ConfigEntry::Stable(ConfigData {
				voters: std::collections::HashSet::new(),
				state_machines: std::collections::BTreeMap::new()
			}),
			config_revision: Revision { history_id: "h".to_string(), term: Term::zero(), seqno: NO_SEQNO },
			pending_branch: None
		}
	}

	#[test]
	fn init_shared_history_test() {
		let mut table = PeerStatusTable::new();
		table.init(&Peer::named("b"), &meta(Term::new(2, "a"), 3, 7), true, 10);

		let s = table.get(&Peer::named("b")).unwrap();
		assert_eq!(s.needs_sync, false);
		assert_eq!(s.sent_seqno, 7);
		assert_eq!(s.acked_seqno, 7);
		assert_eq!(s.acked_commit_seqno, 3);
	}

	#[test]
	fn init_divergent_tail_test() {
		// A peer that last voted in an older term gets re-anchored at its commit point
		let mut table = PeerStatusTable::new();
		table.init(&Peer::named("b"), &meta(Term::new(1, "z"), 3, 7), false, 10);

		let s = table.get(&Peer::named("b")).unwrap();
		assert_eq!(s.needs_sync, true);
		assert_eq!(s.sent_seqno, 3);
		assert_eq!(s.acked_seqno, 3);
	}

	#[test]
	fn init_clean_follower_test() {
		// Nothing past the commit point means nothing to cut back
		let mut table = PeerStatusTable::new();
		table.init(&Peer::named("b"), &meta(Term::new(1, "z"), 5, 5), false, 10);

		let s = table.get(&Peer::named("b")).unwrap();
		assert_eq!(s.needs_sync, false);
		assert_eq!(s.sent_seqno, 5);
	}

	#[test]
	fn mark_requested_test() {
		let mut table = PeerStatusTable::new();

		assert!(table.mark_requested(&Peer::named("b")));
		assert!(!table.mark_requested(&Peer::named("b")));
		assert!(table.contains(&Peer::named("b")));
		assert!(table.get(&Peer::named("b")).is_none());

		table.remove(&Peer::named("b"));
		assert!(table.mark_requested(&Peer::named("b")));
	}

	#[test]
	fn sent_acked_test() {
		let mut table = PeerStatusTable::new();
		table.init(&Peer::named("b"), &meta(Term::new(2, "a"), 2, 4), true, 10);

		table.set_sent(&Peer::named("b"), 9, 4);
		table.set_acked(&Peer::named("b"), 9, 4);

		let s = table.get(&Peer::named("b")).unwrap();
		assert_eq!(s.sent_seqno, 9);
		assert_eq!(s.acked_seqno, 9);
		assert_eq!(s.acked_commit_seqno, 4);
	}

	#[test]
	#[should_panic]
	fn ack_beyond_sent_test() {
		let mut table = PeerStatusTable::new();
		table.init(&Peer::named("b"), &meta(Term::new(2, "a"), 2, 4), true, 10);

		// Acking something that was never dispatched violates the table's invariants
		table.set_acked(&Peer::named("b"), 9, 2);
	}
}
