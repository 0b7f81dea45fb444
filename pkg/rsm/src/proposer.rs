use super::catchup::*;
use super::config_state::*;
use super::log::Log;
use super::protos::*;
use super::quorum::*;
use super::state::*;
use super::sync::SyncId;
use super::sync::SyncTable;

use ::log::{debug, info, warn};

use std::cmp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};


/// If a quorum of establish_term votes has not arrived within this window, the proposer
/// gives up and the shell is expected to trigger a new election elsewhere
pub const ESTABLISH_TERM_TIMEOUT: Duration = Duration::from_millis(10000);

/// How often peers without a status entry get re-probed
pub const CHECK_PEERS_INTERVAL: Duration = Duration::from_millis(5000);

/// How long the server shell should give a synchronous stop to drain
pub const STOP_TIMEOUT: Duration = Duration::from_millis(10000);

/// Pause before retrying a failed catchup transfer
pub const CATCHUP_RETRY_BACKOFF: Duration = Duration::from_millis(1000);


/// All external side effects requested by the proposer while handling a single event
/// The proposer itself never talks to anything: the server shell drains this after every
/// call and performs the dispatches. None of the dispatches may block
pub struct Tick {
	/// Exact time at which this tick is happening
	pub time: Instant,

	/// Set once, when the term is established and the shell may start routing clients here
	pub ready: bool,

	/// If present, the local agent should be told that entries up to this seqno are
	/// committed so that the state machines behind it can apply them
	pub committed: Option<Seqno>,

	/// Requests to dispatch to peer agents
	pub messages: Vec<Message>,

	/// Replies to route back to clients
	pub replies: Vec<Reply>,

	pub catchup: Vec<CatchupAction>,

	/// Peers whose agent monitors are no longer needed
	pub demonitor: Vec<Peer>,

	/// If no other event occurs, cycle() should be called again after this long
	pub next_tick: Option<Duration>
}

impl Tick {
	pub fn empty() -> Tick {
		Tick::at(Instant::now())
	}

	pub fn at(time: Instant) -> Tick {
		Tick {
			time,
			ready: false,
			committed: None,
			messages: vec![],
			replies: vec![],
			catchup: vec![],
			demonitor: vec![],
			next_tick: None
		}
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}

	pub fn reply(&mut self, to: ReplyTo, response: ClientResponse) {
		self.replies.push(Reply { to, response });
	}

	fn wake_within(&mut self, duration: Duration) {
		self.next_tick = Some(match self.next_tick {
			Some(existing) => cmp::min(existing, duration),
			None => duration
		});
	}
}


enum ErrorDisposition {
	/// Keep going; the peer just cannot vote or ack right now
	FailedVote,

	Fatal(StopReason)
}


/// Leader side of one term: establishes the term across the quorum, pipelines log entries
/// to every peer, derives the committed prefix and runs configuration changes
///
/// This is a single-threaded state machine. Every public method handles exactly one event
/// from the shell's mailbox and writes its side effects into the Tick
pub struct Proposer {
	/// Our own concrete peer name. In every quorum we appear as Peer::Local instead
	name: String,

	history_id: HistoryId,

	term: Term,

	/// Read access to the local durable log. Writes go through the local agent, which is
	/// replicated to like any other peer
	log: Arc<dyn Log + Send + Sync>,

	/// Newest configuration in the log. In force from the moment it is in the log
	config: ConfigState,

	/// Effective quorum, always of the shape Joint(All({Local}), ...)
	quorum: Quorum,

	/// quorum_peers(quorum)
	peers: HashSet<Peer>,

	committed_seqno: Seqno,

	high_seqno: Seqno,

	/// Entries assembled but not yet observed committed by the local agent, in seqno order
	pending: VecDeque<LogEntry>,

	statuses: PeerStatusTable,

	/// Peers whose monitor went down and that have not answered anything since
	dead: HashSet<Peer>,

	/// Current monitor ref per peer. A response only counts while its ref is still here
	monitors: HashMap<Peer, MonRef>,

	next_mon_ref: u64,

	/// Failover record handed to us by the local agent, consumed on entry to proposing
	pending_branch: Option<Branch>,

	/// Once a branch was resolved, nothing beyond a peer's committed seqno is trusted
	/// when (re)initializing its status
	branched: bool,

	state: ProposerState
}

impl Proposer {

	/// Creates a proposer for a term that the local agent has already durably recorded.
	/// `meta` is what that local establishment returned; `dead` is the set of peers the
	/// shell currently has no connection to
	///
	/// The returned proposer may already be stopped (e.g. when we are not a voter); the
	/// shell must check the state before routing anything at it
	pub fn start(
		name: &str, term: Term, meta: Metadata, log: Arc<dyn Log + Send + Sync>,
		dead: HashSet<Peer>, tick: &mut Tick
	) -> Proposer {

		// With a pending branch the old configuration is unusable: the term is
		// established against the unanimous survivor set instead
		let election_quorum = match &meta.pending_branch {
			Some(branch) => translate(&Quorum::All(branch.peers.clone()), name),
			None => translate(&config_quorum(&meta.config), name)
		};

		let quorum = require_local(election_quorum.clone());
		let peers = quorum_peers(&quorum);

		let mut proposer = Proposer {
			name: name.to_string(),
			history_id: meta.history_id.clone(),
			term: term.clone(),
			log,
			config: ConfigState::new(
				meta.config.clone(),
				meta.config_revision.clone(),
				meta.config_revision.seqno <= meta.committed_seqno
			),
			quorum,
			peers,
			committed_seqno: meta.committed_seqno,
			high_seqno: meta.high_seqno,
			pending: VecDeque::new(),
			statuses: PeerStatusTable::new(),
			dead: HashSet::new(),
			monitors: HashMap::new(),
			next_mon_ref: 1,
			pending_branch: meta.pending_branch.clone(),
			branched: false,
			state: ProposerState::EstablishTerm(EstablishState {
				votes: HashMap::new(),
				failed_votes: HashSet::new(),
				deadline: tick.time + ESTABLISH_TERM_TIMEOUT
			})
		};

		// Leading a configuration that does not list us is pointless
		if !quorum_peers(&election_quorum).contains(&Peer::Local) {
			proposer.terminate(StopReason::NotVoter, tick);
			return proposer;
		}

		// The local agent is monitored like everyone else; losing it is fatal
		proposer.monitor(&Peer::Local);

		proposer.dead = dead.intersection(&proposer.peers).cloned().collect();
		if let ProposerState::EstablishTerm(ref mut s) = proposer.state {
			s.failed_votes = proposer.dead.clone();
		}

		let request = EstablishTermRequest {
			history_id: proposer.history_id.clone(),
			term: proposer.term.clone(),
			position: Position {
				term_voted: meta.term_voted.clone(),
				high_seqno: meta.high_seqno
			}
		};

		let targets: Vec<Peer> = proposer.peers.iter()
			.filter(|p| **p != Peer::Local && !proposer.dead.contains(p))
			.cloned().collect();

		for peer in targets {
			let mon_ref = proposer.monitor(&peer);
			tick.send(Message {
				to: peer,
				mon_ref,
				descriptor: RequestDescriptor::Vote,
				body: MessageBody::EstablishTerm(request.clone())
			});
		}

		// Our own vote, straight from the local establishment. For a single node cluster
		// this immediately completes the election
		proposer.record_vote(Peer::Local, meta, tick);

		proposer.cycle(tick);
		proposer
	}

	pub fn term(&self) -> &Term {
		&self.term
	}

	pub fn history_id(&self) -> &HistoryId {
		&self.history_id
	}

	pub fn committed_seqno(&self) -> Seqno {
		self.committed_seqno
	}

	pub fn high_seqno(&self) -> Seqno {
		self.high_seqno
	}

	pub fn config(&self) -> &ConfigEntry {
		&self.config.value
	}

	pub fn config_revision(&self) -> &Revision {
		&self.config.revision
	}

	pub fn peers(&self) -> &HashSet<Peer> {
		&self.peers
	}

	pub fn state(&self) -> &ProposerState {
		&self.state
	}

	/// The terminal reason, if the proposer has reached its terminal state
	pub fn stopped(&self) -> Option<&StopReason> {
		match &self.state {
			ProposerState::Stopped(reason) => Some(reason),
			_ => None
		}
	}

	pub fn status(&self, peer: &Peer) -> Option<&PeerStatus> {
		self.statuses.get(peer)
	}

	// ------------------------------------------------------------------
	// Client facing operations
	// ------------------------------------------------------------------

	/// Admits a batch of commands: assigns seqnos, stages the entries and replicates.
	/// Every command is answered on its own reply handle
	pub fn append_commands(&mut self, batch: Vec<(ReplyTo, RsmCommand)>, tick: &mut Tick) {
		match self.state {
			ProposerState::Proposing(_) => {},
			_ => {
				for (reply_to, _) in batch {
					tick.reply(reply_to, ClientResponse::Error(ClientError::NotLeader));
				}
				return;
			}
		}

		// A node on its way out of the configuration stops taking writes
		let being_removed = !self.config.retains_voter(&self.name);

		for (reply_to, command) in batch {
			if being_removed {
				tick.reply(reply_to, ClientResponse::Error(ClientError::NotLeader));
				continue;
			}

			if !self.config.value.state_machines().contains_key(&command.rsm_name) {
				tick.reply(reply_to, ClientResponse::Error(
					ClientError::UnknownRsm(command.rsm_name)
				));
				continue;
			}

			let seqno = self.stage_entry(EntryData::Command(command), tick);
			tick.reply(reply_to, ClientResponse::Accepted(seqno));
		}

		self.replicate(tick);
	}

	/// Read barrier: proves that this proposer was still the leader at some point after
	/// this call by collecting a fresh quorum of ensure_term acks
	pub fn sync_quorum(&mut self, reply_to: ReplyTo, tick: &mut Tick) {
		let id = match self.state {
			ProposerState::Proposing(ref mut s) => {
				let failed: HashSet<Peer> = self.dead.intersection(&self.peers).cloned().collect();
				s.syncs.insert(reply_to, failed)
			},
			_ => {
				tick.reply(reply_to, ClientResponse::Error(ClientError::NotLeader));
				return;
			}
		};

		let request = self.ensure_request();

		let targets: Vec<Peer> = self.peers.iter()
			.filter(|p| **p != Peer::Local && !self.dead.contains(p))
			.cloned().collect();

		for peer in targets {
			let mon_ref = self.monitor(&peer);
			tick.send(Message {
				to: peer,
				mon_ref,
				descriptor: RequestDescriptor::Sync(id),
				body: MessageBody::EnsureTerm(request.clone())
			});
		}

		// A single node cluster is already done at this point
		self.evaluate_sync(id, tick);
	}

	pub fn get_config(&mut self, reply_to: ReplyTo, tick: &mut Tick) {
		match self.state {
			ProposerState::Proposing(ref mut s) => {
				if !self.config.committed {
					s.postponed.push_back(PostponedConfig::Get(reply_to));
					return;
				}
			},
			_ => {
				tick.reply(reply_to, ClientResponse::Error(ClientError::NotLeader));
				return;
			}
		}

		tick.reply(reply_to, ClientResponse::Config {
			config: self.config.value.clone(),
			revision: self.config.revision.clone()
		});
	}

	/// Proposes a joint-consensus transition to new_config, guarded by the revision the
	/// caller last observed. The reply arrives once the settled stable config commits
	pub fn cas_config(
		&mut self, reply_to: ReplyTo, new_config: ConfigData, expected: Revision,
		tick: &mut Tick
	) {
		match self.state {
			ProposerState::Proposing(ref mut s) => {
				if !self.config.committed {
					s.postponed.push_back(PostponedConfig::Cas { reply_to, new_config, expected });
					return;
				}
			},
			_ => {
				tick.reply(reply_to, ClientResponse::Error(ClientError::NotLeader));
				return;
			}
		}

		if expected != self.config.revision {
			tick.reply(reply_to, ClientResponse::Error(
				ClientError::CasFailed(self.config.revision.clone())
			));
			return;
		}

		let current = match &self.config.value {
			ConfigEntry::Stable(c) => c.clone(),
			ConfigEntry::Transition { .. } => {
				// A committed transition is advanced the moment it commits, so a caller
				// can never actually observe this
				tick.reply(reply_to, ClientResponse::Error(
					ClientError::CasFailed(self.config.revision.clone())
				));
				return;
			}
		};

		info!("cas_config at {:?}: moving to voters {:?}", expected, new_config.voters);

		self.propose_entry(EntryData::Transition { current, future: new_config }, tick);

		if let ProposerState::Proposing(ref mut s) = self.state {
			s.cas_waiter = Some(reply_to);
		}
	}

	/// Synchronously drains the proposer. Terminal
	pub fn stop(&mut self, tick: &mut Tick) {
		self.terminate(StopReason::Stopped, tick);
	}

	// ------------------------------------------------------------------
	// Agent response events
	// ------------------------------------------------------------------

	pub fn establish_term_callback(
		&mut self, from: Peer, mon_ref: MonRef,
		result: std::result::Result<Metadata, AgentError>, tick: &mut Tick
	) {
		if !self.accept_response(&from, mon_ref) {
			return;
		}

		match self.state {
			ProposerState::EstablishTerm(_) => {},
			// A vote arriving after the election concluded changes nothing
			_ => return
		}

		match result {
			Ok(meta) => {
				self.dead.remove(&from);
				self.record_vote(from, meta, tick);
			},
			Err(err) => {
				match self.classify_error(&from, &err) {
					ErrorDisposition::FailedVote => {
						if let ProposerState::EstablishTerm(ref mut s) = self.state {
							s.failed_votes.insert(from);
						}
						self.check_votes(tick);
					},
					ErrorDisposition::Fatal(reason) => self.terminate(reason, tick)
				}
			}
		}
	}

	pub fn ensure_term_callback(
		&mut self, from: Peer, mon_ref: MonRef, descriptor: RequestDescriptor,
		result: std::result::Result<Metadata, AgentError>, tick: &mut Tick
	) {
		if !self.accept_response(&from, mon_ref) {
			return;
		}

		match self.state {
			ProposerState::Proposing(_) => {},
			_ => return
		}

		match descriptor {
			RequestDescriptor::Sync(id) => self.sync_vote(from, id, result, tick),
			RequestDescriptor::Probe => self.probe_response(from, result, tick),
			_ => {}
		}
	}

	pub fn append_callback(
		&mut self, from: Peer, mon_ref: MonRef,
		result: std::result::Result<AppendResponse, AgentError>, tick: &mut Tick
	) {
		if !self.accept_response(&from, mon_ref) {
			return;
		}

		match self.state {
			ProposerState::Proposing(_) => {},
			_ => return
		}

		match result {
			Ok(ack) => {
				// The status may have been dropped while this ack was in flight
				if self.statuses.get(&from).is_none() {
					return;
				}

				self.dead.remove(&from);
				self.statuses.set_acked(&from, ack.high_seqno, ack.committed_seqno);

				// Entries the local agent knows to be committed have been handed to the
				// state machines and are no longer ours to carry
				if from == Peer::Local {
					while let Some(front) = self.pending.front() {
						if front.seqno > ack.committed_seqno {
							break;
						}
						self.pending.pop_front();
					}
				}

				self.derive_committed(tick);
				self.replicate(tick);
			},
			Err(err) => {
				match self.classify_error(&from, &err) {
					ErrorDisposition::Fatal(reason) => self.terminate(reason, tick),
					ErrorDisposition::FailedVote => {
						if from == Peer::Local {
							// Nothing can ever commit again if our own agent stops
							// taking entries
							self.terminate(StopReason::UnexpectedError(
								"local agent rejected an append".to_string()
							), tick);
							return;
						}

						// Forget the peer; the next check_peers sweep re-probes it and
						// replication re-anchors
						warn!("append to {:?} failed: {:?}", from, err);
						self.statuses.remove(&from);
					}
				}
			}
		}
	}

	pub fn catchup_callback(
		&mut self, from: Peer, mon_ref: MonRef,
		result: std::result::Result<Seqno, String>, tick: &mut Tick
	) {
		if !self.accept_response(&from, mon_ref) {
			return;
		}

		match self.state {
			ProposerState::Proposing(_) => {},
			_ => return
		}

		let in_progress = self.statuses.get(&from)
			.map(|s| s.catchup_in_progress)
			.unwrap_or(false);
		if !in_progress {
			return;
		}

		match result {
			Ok(upto) => {
				self.dead.remove(&from);

				if let Some(status) = self.statuses.get_mut(&from) {
					status.catchup_in_progress = false;
				}

				let commit = cmp::min(self.committed_seqno, upto);
				self.statuses.set_sent(&from, upto, commit);
				self.statuses.set_acked(&from, upto, commit);

				self.derive_committed(tick);

				// Anything newer than the transfer goes the normal way
				self.replicate(tick);
			},
			Err(msg) => {
				warn!("catchup for {:?} failed: {}", from, msg);

				if let Some(status) = self.statuses.get_mut(&from) {
					status.catchup_in_progress = false;
				}

				if let ProposerState::Proposing(ref mut s) = self.state {
					s.catchup.note_failure(&from, tick.time + CATCHUP_RETRY_BACKOFF);
				}

				tick.wake_within(CATCHUP_RETRY_BACKOFF);
			}
		}
	}

	/// The monitor for a peer's agent fired. Stale refs are ignored
	pub fn peer_down(&mut self, peer: Peer, mon_ref: MonRef, tick: &mut Tick) {
		match self.monitors.get(&peer) {
			Some(r) if *r == mon_ref => {},
			_ => return
		}

		if peer == Peer::Local {
			self.terminate(StopReason::LocalAgentDown, tick);
			return;
		}

		warn!("peer {:?} went down", peer);

		self.monitors.remove(&peer);

		let catchup = self.statuses.get(&peer)
			.map(|s| s.catchup_in_progress)
			.unwrap_or(false);
		if catchup {
			tick.catchup.push(CatchupAction::Cancel { peer: peer.clone() });
		}

		self.statuses.remove(&peer);
		self.dead.insert(peer.clone());

		let sync_ids = match self.state {
			ProposerState::EstablishTerm(ref mut s) => {
				if !s.votes.contains_key(&peer) {
					s.failed_votes.insert(peer.clone());
				}
				vec![]
			},
			ProposerState::Proposing(ref mut s) => {
				s.syncs.fail_peer(&peer);
				s.catchup.clear(&peer);
				s.syncs.ids()
			},
			ProposerState::Stopped(_) => return
		};

		match self.state {
			ProposerState::EstablishTerm(_) => self.check_votes(tick),
			_ => {
				for id in sync_ids {
					self.evaluate_sync(id, tick);
				}
			}
		}
	}

	/// Timer processing. The shell calls this whenever the previous next_tick elapses
	pub fn cycle(&mut self, tick: &mut Tick) {
		let deadline = match self.state {
			ProposerState::EstablishTerm(ref s) => Some(s.deadline),
			_ => None
		};

		if let Some(deadline) = deadline {
			if tick.time >= deadline {
				warn!("term {:?} was not established in time", self.term);
				self.terminate(StopReason::EstablishTimeout, tick);
				return;
			}

			tick.wake_within(deadline - tick.time);
			return;
		}

		let (sweep, next_check) = match self.state {
			ProposerState::Proposing(ref mut s) => {
				let sweep = tick.time >= s.next_check_peers;
				if sweep {
					s.next_check_peers = tick.time + CHECK_PEERS_INTERVAL;
				}
				(sweep, s.next_check_peers)
			},
			_ => return
		};

		if sweep {
			self.check_peers(tick);
		}

		// Catchups whose backoff expired get retried through the normal replication path
		let retry = match self.state {
			ProposerState::Proposing(ref s) => s.catchup.next_deadline(),
			_ => return
		};

		if let Some(at) = retry {
			if tick.time >= at {
				self.replicate(tick);
			}
			else {
				tick.wake_within(at - tick.time);
			}
		}

		match self.state {
			ProposerState::Proposing(_) => {
				tick.wake_within(next_check - tick.time);
			},
			_ => {}
		}
	}

	// ------------------------------------------------------------------
	// Election
	// ------------------------------------------------------------------

	fn record_vote(&mut self, from: Peer, meta: Metadata, tick: &mut Tick) {
		// A committed prefix is never reverted, so a voter may legitimately know about
		// commits that we have not witnessed yet
		if meta.committed_seqno > self.committed_seqno {
			self.committed_seqno = meta.committed_seqno;
		}

		match self.state {
			ProposerState::EstablishTerm(ref mut s) => {
				s.failed_votes.remove(&from);
				s.votes.insert(from, meta);
			},
			_ => return
		}

		self.check_votes(tick);
	}

	fn check_votes(&mut self, tick: &mut Tick) {
		enum VoteOutcome {
			Won,
			Wait,
			Lost
		}

		let outcome = match self.state {
			ProposerState::EstablishTerm(ref s) => {
				let votes: HashSet<Peer> = s.votes.keys().cloned().collect();

				if have_quorum(&votes, &self.quorum) {
					VoteOutcome::Won
				}
				else if is_feasible(&self.peers, &s.failed_votes, &self.quorum) {
					VoteOutcome::Wait
				}
				else {
					VoteOutcome::Lost
				}
			},
			_ => return
		};

		match outcome {
			VoteOutcome::Won => self.become_proposing(tick),
			VoteOutcome::Lost => self.terminate(StopReason::NoQuorum, tick),
			VoteOutcome::Wait => {}
		}
	}

	fn become_proposing(&mut self, tick: &mut Tick) {
		let votes = match mem::replace(&mut self.state, ProposerState::Proposing(ProposingState {
			syncs: SyncTable::new(),
			next_check_peers: tick.time + CHECK_PEERS_INTERVAL,
			catchup: CatchupTracker::new(),
			cas_waiter: None,
			postponed: VecDeque::new()
		})) {
			ProposerState::EstablishTerm(s) => s.votes,
			_ => panic!("Establishing an already established term")
		};

		info!(
			"established term {:?} on history {:?} (committed {}, high {})",
			self.term, self.history_id, self.committed_seqno, self.high_seqno
		);

		// Transfer engine for peers too far behind to append to
		tick.catchup.push(CatchupAction::Start);

		// Entries we inherited but still have to get committed
		if self.high_seqno > self.committed_seqno {
			match self.log.entries(self.committed_seqno + 1, self.high_seqno) {
				Some(entries) => {
					for entry in entries {
						self.pending.push_back(entry);
					}
				},
				None => {
					self.terminate(StopReason::UnexpectedError(
						"local log is missing its own uncommitted suffix".to_string()
					), tick);
					return;
				}
			}
		}

		// An operator-declared failover overrides whatever the old quorum left behind
		if let Some(branch) = self.pending_branch.take() {
			self.resolve_branch(branch, tick);
		}

		// Statuses for everyone whose vote we hold. After a branch only committed
		// prefixes are trustworthy, no matter what the votes said
		for (peer, meta) in votes {
			let shared = !self.branched && meta.term_voted == self.term;
			self.statuses.init(&peer, &meta, shared, self.high_seqno);
		}

		// Votes may have taught us about commits, possibly of the newest config entry
		// itself
		if self.config.commit(self.committed_seqno) {
			self.config_committed(tick);
		}

		// The inherited suffix may already sit on a quorum of the voters
		self.derive_committed(tick);

		// A transition that was committed before our time still wants its stable half
		self.advance_transition(tick);

		tick.ready = true;

		self.replicate(tick);
		self.cycle(tick);
	}

	// ------------------------------------------------------------------
	// Log building and replication
	// ------------------------------------------------------------------

	/// Assigns the next seqno and stages an entry, without dispatching anything yet
	fn stage_entry(&mut self, data: EntryData, tick: &mut Tick) -> Seqno {
		let seqno = self.high_seqno + 1;

		let entry = LogEntry {
			history_id: self.history_id.clone(),
			term: self.term.clone(),
			seqno,
			data
		};

		// Configurations count from the moment they exist in the log
		if entry.data.as_config().is_some() {
			self.apply_config(&entry, tick);
		}

		self.pending.push_back(entry);
		self.high_seqno = seqno;
		seqno
	}

	fn propose_entry(&mut self, data: EntryData, tick: &mut Tick) -> Seqno {
		let seqno = self.stage_entry(data, tick);
		self.replicate(tick);
		seqno
	}

	fn apply_config(&mut self, entry: &LogEntry, tick: &mut Tick) {
		self.config.apply(entry);

		let quorum = require_local(translate(&config_quorum(&self.config.value), &self.name));
		let peers = quorum_peers(&quorum);

		let added: Vec<Peer> = peers.difference(&self.peers).cloned().collect();

		self.quorum = quorum;
		self.peers = peers;

		let sync_ids = match self.state {
			ProposerState::Proposing(ref s) => s.syncs.ids(),
			_ => vec![]
		};

		for peer in added {
			// Outstanding read barriers must be able to assemble a quorum of the new
			// expression as well
			for id in &sync_ids {
				let mon_ref = self.monitor(&peer);
				let request = self.ensure_request();
				tick.send(Message {
					to: peer.clone(),
					mon_ref,
					descriptor: RequestDescriptor::Sync(*id),
					body: MessageBody::EnsureTerm(request)
				});
			}

			// And replication to them starts now, not at the next sweep
			self.probe(&peer, tick);
		}
	}

	fn resolve_branch(&mut self, branch: Branch, tick: &mut Tick) {
		// The survivors acknowledged the branch unanimously, which makes the committed
		// prefix safe. Anything uncommitted may belong to the partitioned-away majority
		// and has to go
		warn!(
			"resolving branch onto {:?}: keeping committed prefix up to {}, dropping up to {}",
			branch.history_id, self.committed_seqno, self.high_seqno
		);

		while let Some(back) = self.pending.back() {
			if back.seqno <= self.committed_seqno {
				break;
			}
			self.pending.pop_back();
		}

		self.high_seqno = self.committed_seqno;
		self.branched = true;

		let state_machines = self.config.value.state_machines().clone();
		self.propose_entry(EntryData::Config(ConfigData {
			voters: branch.peers,
			state_machines
		}), tick);
	}

	fn advance_transition(&mut self, tick: &mut Tick) {
		if !self.config.committed {
			return;
		}

		if let Some(future) = self.config.future_config() {
			info!("advancing committed transition {:?} to its stable config", self.config.revision);
			self.propose_entry(EntryData::Config(future), tick);
		}
	}

	fn replicate(&mut self, tick: &mut Tick) {
		match self.state {
			ProposerState::Proposing(_) => {},
			_ => return
		}

		let targets: Vec<Peer> = self.statuses.iter_ready()
			.map(|(peer, _)| peer.clone())
			.collect();

		for peer in targets {
			self.replicate_to(&peer, tick);
		}
	}

	fn replicate_to(&mut self, peer: &Peer, tick: &mut Tick) {
		let sent_seqno = match self.statuses.get(peer) {
			Some(status) => {
				if status.catchup_in_progress {
					return;
				}

				let wanted = status.needs_sync
					|| self.high_seqno > status.sent_seqno
					|| self.committed_seqno > status.sent_commit_seqno;
				if !wanted {
					return;
				}

				status.sent_seqno
			},
			None => return
		};

		let entries = match self.fetch_entries(sent_seqno + 1, self.high_seqno) {
			Some(entries) => entries,
			None => {
				// The gap reaches below the retained log; only a bulk transfer helps
				self.start_catchup(peer, sent_seqno + 1, tick);
				return;
			}
		};

		let request = AppendRequest {
			history_id: self.history_id.clone(),
			term: self.term.clone(),
			committed_seqno: self.committed_seqno,
			prev_seqno: sent_seqno,
			entries
		};

		let mon_ref = self.monitor(peer);

		// Optimistic: the next round only considers what comes after this dispatch
		self.statuses.set_sent(peer, self.high_seqno, self.committed_seqno);

		tick.send(Message {
			to: peer.clone(),
			mon_ref,
			descriptor: RequestDescriptor::Append,
			body: MessageBody::Append(request)
		});
	}

	/// Entries in the inclusive range, stitched from the local log and the pending queue.
	/// None when the range reaches below the retained log
	fn fetch_entries(&self, first: Seqno, last: Seqno) -> Option<Vec<LogEntry>> {
		if first > last {
			return Some(vec![]);
		}

		let pending_first = self.pending.front().map(|e| e.seqno).unwrap_or(last + 1);

		let mut out = vec![];

		if first < pending_first {
			if first < self.log.first_seqno() {
				return None;
			}

			let upto = cmp::min(last, pending_first - 1);
			out.extend(self.log.entries(first, upto)?);
		}

		for entry in &self.pending {
			if entry.seqno >= first && entry.seqno <= last {
				out.push(entry.clone());
			}
		}

		Some(out)
	}

	fn start_catchup(&mut self, peer: &Peer, from: Seqno, tick: &mut Tick) {
		let ready = match self.state {
			ProposerState::Proposing(ref s) => s.catchup.ready(peer, tick.time),
			_ => false
		};

		if !ready {
			return;
		}

		match self.statuses.get_mut(peer) {
			Some(status) => {
				if status.catchup_in_progress {
					return;
				}
				status.catchup_in_progress = true;
			},
			None => return
		}

		if let ProposerState::Proposing(ref mut s) = self.state {
			s.catchup.clear(peer);
		}

		let mon_ref = self.monitor(peer);
		info!("handing {:?} to catchup from seqno {}", peer, from);
		tick.catchup.push(CatchupAction::Transfer {
			peer: peer.clone(),
			mon_ref,
			from_seqno: from
		});
	}

	// ------------------------------------------------------------------
	// Commit derivation and configuration changes
	// ------------------------------------------------------------------

	fn derive_committed(&mut self, tick: &mut Tick) {
		let mut acked: Vec<(Peer, Seqno)> = self.statuses.iter_ready()
			.map(|(peer, status)| (peer.clone(), status.acked_seqno))
			.collect();

		// Walking acks from the top, the first prefix whose peers form a quorum yields
		// the highest committable seqno
		acked.sort_by(|a, b| b.1.cmp(&a.1));

		let mut votes = HashSet::new();
		let mut candidate = NO_SEQNO;

		for (peer, seqno) in acked {
			if seqno == NO_SEQNO {
				break;
			}

			votes.insert(peer);

			if have_quorum(&votes, &self.quorum) {
				candidate = seqno;
				break;
			}
		}

		// The deduced value shrinks when a voter's status is dropped; the committed
		// seqno itself never moves backwards
		if candidate > self.committed_seqno {
			self.update_committed(candidate, tick);
		}
	}

	fn update_committed(&mut self, seqno: Seqno, tick: &mut Tick) {
		assert!(seqno > self.committed_seqno);

		self.committed_seqno = seqno;
		tick.committed = Some(seqno);

		if self.config.commit(seqno) {
			self.config_committed(tick);
		}
	}

	/// Runs when the newest configuration entry crosses the committed boundary
	fn config_committed(&mut self, tick: &mut Tick) {
		info!("config {:?} committed", self.config.revision);

		// Whoever fell out of the configuration loses its bookkeeping
		for peer in self.statuses.peers() {
			if !self.peers.contains(&peer) {
				self.drop_peer_state(&peer, tick);
			}
		}

		let peers = self.peers.clone();
		self.dead.retain(|p| peers.contains(p));

		let stable = !self.config.is_transition();

		// Our removal only counts once it is stable and committed
		let leader_removed = stable && !self.config.retains_voter(&self.name);

		if stable {
			let waiter = match self.state {
				ProposerState::Proposing(ref mut s) => s.cas_waiter.take(),
				_ => None
			};

			if let Some(reply_to) = waiter {
				tick.reply(reply_to, ClientResponse::ConfigChanged(self.config.revision.clone()));
			}
		}

		// A committed transition immediately proposes its stable half
		self.advance_transition(tick);

		if leader_removed {
			self.terminate(StopReason::LeaderRemoved, tick);
			return;
		}

		self.replay_postponed(tick);
	}

	fn replay_postponed(&mut self, tick: &mut Tick) {
		let postponed = match self.state {
			ProposerState::Proposing(ref mut s) => {
				mem::replace(&mut s.postponed, VecDeque::new())
			},
			_ => return
		};

		for request in postponed {
			match request {
				PostponedConfig::Get(reply_to) => self.get_config(reply_to, tick),
				PostponedConfig::Cas { reply_to, new_config, expected } => {
					self.cas_config(reply_to, new_config, expected, tick);
				}
			}
		}
	}

	// ------------------------------------------------------------------
	// Sync quorum and probing
	// ------------------------------------------------------------------

	fn sync_vote(
		&mut self, from: Peer, id: SyncId,
		result: std::result::Result<Metadata, AgentError>, tick: &mut Tick
	) {
		match result {
			Ok(_) => {
				self.dead.remove(&from);

				if let ProposerState::Proposing(ref mut s) = self.state {
					if let Some(request) = s.syncs.get_mut(id) {
						request.votes.insert(from);
					}
				}
			},
			Err(err) => {
				match self.classify_error(&from, &err) {
					ErrorDisposition::Fatal(reason) => {
						self.terminate(reason, tick);
						return;
					},
					ErrorDisposition::FailedVote => {
						if let ProposerState::Proposing(ref mut s) = self.state {
							if let Some(request) = s.syncs.get_mut(id) {
								request.failed_votes.insert(from);
							}
						}
					}
				}
			}
		}

		self.evaluate_sync(id, tick);
	}

	fn evaluate_sync(&mut self, id: SyncId, tick: &mut Tick) {
		let held = {
			let request = match self.state {
				ProposerState::Proposing(ref mut s) => {
					match s.syncs.get_mut(id) {
						Some(r) => r,
						None => return
					}
				},
				_ => return
			};

			if have_quorum(&request.votes, &self.quorum) {
				true
			}
			else if !is_feasible(&self.peers, &request.failed_votes, &self.quorum) {
				false
			}
			else {
				return;
			}
		};

		let request = match self.state {
			ProposerState::Proposing(ref mut s) => s.syncs.remove(id).unwrap(),
			_ => return
		};

		if held {
			tick.reply(request.reply_to, ClientResponse::Synced);
		}
		else {
			tick.reply(request.reply_to, ClientResponse::Error(ClientError::NoQuorum));
		}
	}

	fn probe_response(
		&mut self, from: Peer,
		result: std::result::Result<Metadata, AgentError>, tick: &mut Tick
	) {
		match result {
			Ok(meta) => {
				self.dead.remove(&from);

				// The same argument as for votes: a committed prefix is never reverted,
				// so a probed peer may know about commits from before our election that
				// never reached us
				let known = cmp::min(meta.committed_seqno, self.high_seqno);
				if known > self.committed_seqno {
					self.update_committed(known, tick);
				}

				match self.state {
					ProposerState::Proposing(_) => {},
					// The learned commit may have settled our own removal
					_ => return
				}

				if self.statuses.get(&from).is_some() {
					// Some earlier response already initialized this peer
					return;
				}

				let shared = !self.branched && meta.term_voted == self.term;
				self.statuses.init(&from, &meta, shared, self.high_seqno);
				self.replicate(tick);
			},
			Err(err) => {
				match self.classify_error(&from, &err) {
					ErrorDisposition::Fatal(reason) => self.terminate(reason, tick),
					ErrorDisposition::FailedVote => {
						// Clears the placeholder so the next sweep tries again
						self.statuses.remove(&from);
					}
				}
			}
		}
	}

	fn check_peers(&mut self, tick: &mut Tick) {
		let targets: Vec<Peer> = self.peers.iter()
			.filter(|p| **p != Peer::Local && !self.statuses.contains(p))
			.cloned().collect();

		for peer in targets {
			self.probe(&peer, tick);
		}
	}

	fn probe(&mut self, peer: &Peer, tick: &mut Tick) {
		if *peer == Peer::Local || !self.statuses.mark_requested(peer) {
			return;
		}

		let mon_ref = self.monitor(peer);
		let request = self.ensure_request();
		tick.send(Message {
			to: peer.clone(),
			mon_ref,
			descriptor: RequestDescriptor::Probe,
			body: MessageBody::EnsureTerm(request)
		});
	}

	// ------------------------------------------------------------------
	// Plumbing
	// ------------------------------------------------------------------

	fn ensure_request(&self) -> EnsureTermRequest {
		EnsureTermRequest {
			history_id: self.history_id.clone(),
			term: self.term.clone()
		}
	}

	fn monitor(&mut self, peer: &Peer) -> MonRef {
		if let Some(r) = self.monitors.get(peer) {
			return *r;
		}

		let r = MonRef(self.next_mon_ref);
		self.next_mon_ref += 1;
		self.monitors.insert(peer.clone(), r);
		r
	}

	/// Whether a response may touch any state: its peer must still be known and the ref
	/// must match the monitor that was alive when the request went out
	fn accept_response(&self, from: &Peer, mon_ref: MonRef) -> bool {
		if !self.peers.contains(from) {
			debug!("dropping response from non-peer {:?}", from);
			return false;
		}

		match self.monitors.get(from) {
			Some(r) if *r == mon_ref => true,
			_ => {
				debug!("dropping stale response from {:?}", from);
				false
			}
		}
	}

	fn classify_error(&self, from: &Peer, err: &AgentError) -> ErrorDisposition {
		match err {
			AgentError::ConflictingTerm(other) => {
				if *other > self.term {
					ErrorDisposition::Fatal(StopReason::ConflictingTerm(other.clone()))
				}
				else {
					// Another candidate at our own term number. Enough of the others may
					// still answer to us
					warn!("peer {:?} reported a concurrent term {:?}", from, other);
					ErrorDisposition::FailedVote
				}
			},
			AgentError::HistoryMismatch => {
				ErrorDisposition::Fatal(StopReason::HistoryMismatch)
			},
			AgentError::Behind => ErrorDisposition::FailedVote,
			AgentError::Failed(msg) => {
				ErrorDisposition::Fatal(StopReason::UnexpectedError(msg.clone()))
			}
		}
	}

	fn drop_peer_state(&mut self, peer: &Peer, tick: &mut Tick) {
		let catchup = self.statuses.get(peer)
			.map(|s| s.catchup_in_progress)
			.unwrap_or(false);
		if catchup {
			tick.catchup.push(CatchupAction::Cancel { peer: peer.clone() });
		}

		self.statuses.remove(peer);

		if self.monitors.remove(peer).is_some() {
			tick.demonitor.push(peer.clone());
		}
	}

	fn terminate(&mut self, reason: StopReason, tick: &mut Tick) {
		if let ProposerState::Stopped(_) = self.state {
			return;
		}

		info!("proposer for term {:?} stopping: {:?}", self.term, reason);

		let old = mem::replace(&mut self.state, ProposerState::Stopped(reason));

		if let ProposerState::Proposing(mut s) = old {
			for request in s.syncs.drain() {
				tick.reply(request.reply_to, ClientResponse::Error(ClientError::NotLeader));
			}

			if let Some(reply_to) = s.cas_waiter.take() {
				tick.reply(reply_to, ClientResponse::Error(ClientError::LeaderLost));
			}

			for request in s.postponed {
				let reply_to = match request {
					PostponedConfig::Get(r) => r,
					PostponedConfig::Cas { reply_to, .. } => reply_to
				};
				tick.reply(reply_to, ClientResponse::Error(ClientError::LeaderLost));
			}

			// Best effort: hand the local agent whatever we know to be committed one
			// last time
			tick.committed = Some(self.committed_seqno);

			tick.catchup.push(CatchupAction::Stop);
		}

		for (peer, _) in self.monitors.drain() {
			tick.demonitor.push(peer);
		}
	}
}
