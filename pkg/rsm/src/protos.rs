use std::collections::{BTreeMap, HashSet};

/*
	NOTE: Everything in here is either stored in a log or sent over the wire, so all of it
	derives Serialize/Deserialize and must stay backwards compatible

	The proposer itself never serializes any of these: the server shell owns the transport
	and uses rpc::marshal / rpc::unmarshal on message bodies
*/

/// Monotonic position of an entry within a single history. The first real entry of a log
/// is always at seqno 1
pub type Seqno = u64;

/// Sentinel meaning 'no entry'. Real seqnos start at 1
pub const NO_SEQNO: Seqno = 0;

/// Identifies one lineage of committed entries. This only ever changes when an operator
/// resolves a branch (quorum failover), at which point the surviving peers adopt a fresh id
pub type HistoryId = String;

/// Identity of a single node in the cluster
/// The `Local` alias always means 'the node this code is running on' and is produced by
/// quorum::translate so that the local agent can be addressed without knowing our own name
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Peer {
	Local,
	Named(String)
}

impl Peer {
	pub fn named(name: &str) -> Peer {
		Peer::Named(name.to_string())
	}
}

/// Leadership epoch. Terms are totally ordered by number and then by the tiebreaker, and a
/// proposer owns exactly one term for its whole lifetime
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
	pub number: u64,
	pub tiebreak: String
}

impl Term {
	pub fn new(number: u64, tiebreak: &str) -> Term {
		Term { number, tiebreak: tiebreak.to_string() }
	}

	/// The term before any election has ever happened
	pub fn zero() -> Term {
		Term { number: 0, tiebreak: String::new() }
	}
}

/// Uniquely identifies a single log entry across histories and terms
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Revision {
	pub history_id: HistoryId,
	pub term: Term,
	pub seqno: Seqno
}

/// Opaque per-machine configuration blob. The proposer never looks inside of it
pub type RsmConfig = Vec<u8>;

/// A stable cluster configuration: the voting peers plus the set of state machines that
/// commands may be routed to
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigData {
	pub voters: HashSet<Peer>,
	pub state_machines: BTreeMap<String, RsmConfig>
}

/// The newest configuration known to an agent: either a stable one or a joint-consensus
/// transition that is still in flight
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ConfigEntry {
	Stable(ConfigData),
	Transition { current: ConfigData, future: ConfigData }
}

impl ConfigEntry {
	/// The voter set that will be in force once this configuration has fully settled
	pub fn future_voters(&self) -> &HashSet<Peer> {
		match self {
			ConfigEntry::Stable(c) => &c.voters,
			ConfigEntry::Transition { future, .. } => &future.voters
		}
	}

	/// State machines commands may currently be admitted for
	/// A committed transition always advances, so the future side is authoritative
	pub fn state_machines(&self) -> &BTreeMap<String, RsmConfig> {
		match self {
			ConfigEntry::Stable(c) => &c.state_machines,
			ConfigEntry::Transition { future, .. } => &future.state_machines
		}
	}
}

/// An opaque command addressed to one named state machine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RsmCommand {
	pub rsm_name: String,
	pub payload: Vec<u8>
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EntryData {
	/// Routed to the named state machine once committed
	Command(RsmCommand),

	/// A stable configuration takes effect as soon as it is in the log
	Config(ConfigData),

	/// Joint-consensus membership change; both the current and the future voter sets must
	/// acknowledge everything until the follow-up stable entry commits
	Transition { current: ConfigData, future: ConfigData }
}

impl EntryData {
	/// Views a config-bearing entry as a ConfigEntry. Commands yield None
	pub fn as_config(&self) -> Option<ConfigEntry> {
		match self {
			EntryData::Command(_) => None,
			EntryData::Config(c) => Some(ConfigEntry::Stable(c.clone())),
			EntryData::Transition { current, future } => Some(ConfigEntry::Transition {
				current: current.clone(), future: future.clone()
			})
		}
	}
}

/// A single entry of the replicated log. Entries are immutable once appended; an
/// uncommitted suffix may only disappear when a higher term establishes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub history_id: HistoryId,
	pub term: Term,
	pub seqno: Seqno,
	pub data: EntryData
}

impl LogEntry {
	pub fn revision(&self) -> Revision {
		Revision { history_id: self.history_id.clone(), term: self.term.clone(), seqno: self.seqno }
	}
}

/// Record persisted by the agents when an operator declares quorum failover. The proposer
/// consumes it exactly once, on entry to proposing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Branch {
	pub history_id: HistoryId,
	pub coordinator: Peer,
	pub peers: HashSet<Peer>
}

/// Snapshot of a single agent's durable state, as returned by establish_term / ensure_term
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
	pub peer: Peer,
	pub history_id: HistoryId,

	/// Highest term the agent has adopted
	pub term: Term,

	/// Term of the establishment the agent last acknowledged
	pub term_voted: Term,

	pub high_seqno: Seqno,
	pub committed_seqno: Seqno,

	/// Newest configuration in the agent's log, committed or not
	pub config: ConfigEntry,
	pub config_revision: Revision,

	pub pending_branch: Option<Branch>
}

/// The position a candidate proposer advertises when establishing its term
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Position {
	pub term_voted: Term,
	pub high_seqno: Seqno
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EstablishTermRequest {
	pub history_id: HistoryId,
	pub term: Term,
	pub position: Position
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnsureTermRequest {
	pub history_id: HistoryId,
	pub term: Term
}

/// NOTE: There is intentionally no previous-entry term in here. Divergent tails are cut
/// back at establishment time or through the needs_sync anchor, never probed per-append
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendRequest {
	pub history_id: HistoryId,
	pub term: Term,
	pub committed_seqno: Seqno,

	/// Entries immediately follow this seqno in the target's log
	pub prev_seqno: Seqno,

	pub entries: Vec<LogEntry>
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendResponse {
	pub high_seqno: Seqno,
	pub committed_seqno: Seqno
}

/// Protocol failures an agent can answer with. These are data rather than errors: they
/// travel over the wire and most of them are survivable for the proposer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AgentError {
	/// The agent has adopted some other term. Fatal when that term is higher than ours
	ConflictingTerm(Term),

	/// The agent is on a history we have not ingested (a branch happened elsewhere)
	HistoryMismatch,

	/// Our advertised position is missing entries the agent has already committed
	Behind,

	/// Anything unexpected. Always fatal to the proposer
	Failed(String)
}

/// Reference to the monitor that was active for a peer when a request was dispatched.
/// Responses carrying a ref that no longer matches are dropped without touching any state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonRef(pub u64);

/// Tells the response router which kind of request a reply belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestDescriptor {
	/// establish_term during election
	Vote,

	/// ensure_term sent by check_peers to learn a peer's position
	Probe,

	/// ensure_term on behalf of one outstanding sync-quorum request
	Sync(u64),

	Append
}

pub enum MessageBody {
	EstablishTerm(EstablishTermRequest),
	EnsureTerm(EnsureTermRequest),
	Append(AppendRequest)
}

/// One outbound request to a peer's agent. The (mon_ref, descriptor) pair is the opaque
/// tag the shell must echo back together with the response
pub struct Message {
	pub to: Peer,
	pub mon_ref: MonRef,
	pub descriptor: RequestDescriptor,
	pub body: MessageBody
}

/// Opaque routing handle for replying to one client call. Minted by the server shell
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReplyTo(pub u64);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientError {
	NotLeader,
	UnknownRsm(String),
	CasFailed(Revision),
	NoQuorum,

	/// The proposer terminated while the request was in flight
	LeaderLost
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientResponse {
	/// The command was assigned a seqno and will be replicated
	Accepted(Seqno),

	Config { config: ConfigEntry, revision: Revision },

	/// A cas_config round trip finished; the revision is that of the settled stable config
	ConfigChanged(Revision),

	/// The sync-quorum read barrier held
	Synced,

	Error(ClientError)
}

pub struct Reply {
	pub to: ReplyTo,
	pub response: ClientResponse
}
