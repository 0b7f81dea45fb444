use super::protos::*;

/// Tracks the newest configuration in the log together with whether it has committed yet
/// A configuration takes effect for quorum purposes the moment its entry exists in the
/// log; committing it only unlocks follow-up changes
pub struct ConfigState {
	pub value: ConfigEntry,
	pub revision: Revision,
	pub committed: bool
}

impl ConfigState {
	pub fn new(value: ConfigEntry, revision: Revision, committed: bool) -> ConfigState {
		ConfigState { value, revision, committed }
	}

	/// Incorporates a config-bearing log entry. Returns false for plain commands
	pub fn apply(&mut self, entry: &LogEntry) -> bool {
		let config = match entry.data.as_config() {
			Some(c) => c,
			None => return false
		};

		self.value = config;
		self.revision = entry.revision();
		self.committed = false;
		true
	}

	/// Called when the committed seqno advances. Returns true exactly when the newest
	/// configuration crossed the committed boundary with this advance
	pub fn commit(&mut self, committed_seqno: Seqno) -> bool {
		if self.committed || self.revision.seqno > committed_seqno {
			return false;
		}

		self.committed = true;
		true
	}

	pub fn is_transition(&self) -> bool {
		match self.value {
			ConfigEntry::Transition { .. } => true,
			_ => false
		}
	}

	/// The stable config a committed transition must be advanced to
	pub fn future_config(&self) -> Option<ConfigData> {
		match &self.value {
			ConfigEntry::Transition { future, .. } => Some(future.clone()),
			_ => None
		}
	}

	/// Whether the named node will still be a voter once this configuration settles
	pub fn retains_voter(&self, name: &str) -> bool {
		self.value.future_voters().contains(&Peer::named(name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::{BTreeMap, HashSet};

	fn config(voters: &[&str]) -> ConfigData {
		ConfigData {
			voters: voters.iter().map(|n| Peer::named(n)).collect::<HashSet<_>>(),
			state_machines: BTreeMap::new()
		}
	}

	fn config_log_entry(seqno: Seqno, data: EntryData) -> LogEntry {
		LogEntry { history_id: "h".to_string(), term: Term::new(1, "a"), seqno, data }
	}

	#[test]
	fn apply_commit_test() {
		let base = config(&["a", "b", "c"]);
		let mut state = ConfigState::new(
			ConfigEntry::Stable(base.clone()),
			Revision { history_id: "h".to_string(), term: Term::zero(), seqno: 1 },
			true
		);

		let entry = config_log_entry(4, EntryData::Transition {
			current: base, future: config(&["a", "b", "d"])
		});

		assert!(state.apply(&entry));
		assert!(!state.committed);
		assert!(state.is_transition());
		assert_eq!(state.revision.seqno, 4);

		// Committing below the config entry does nothing
		assert!(!state.commit(3));
		assert!(!state.committed);

		assert!(state.commit(5));
		assert!(state.committed);

		// Only the crossing advance reports true
		assert!(!state.commit(6));
	}

	#[test]
	fn retains_voter_test() {
		let state = ConfigState::new(
			ConfigEntry::Transition { current: config(&["a", "b", "c"]), future: config(&["b", "c"]) },
			Revision { history_id: "h".to_string(), term: Term::new(1, "a"), seqno: 2 },
			false
		);

		// Removal is visible from the moment the transition is in the log
		assert!(!state.retains_voter("a"));
		assert!(state.retains_voter("b"));
	}

	#[test]
	fn command_is_not_config_test() {
		let mut state = ConfigState::new(
			ConfigEntry::Stable(config(&["a"])),
			Revision { history_id: "h".to_string(), term: Term::zero(), seqno: 1 },
			true
		);

		let entry = config_log_entry(2, EntryData::Command(RsmCommand {
			rsm_name: "kv".to_string(), payload: vec![]
		}));

		assert!(!state.apply(&entry));
		assert_eq!(state.revision.seqno, 1);
	}
}
