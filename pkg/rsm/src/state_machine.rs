use super::protos::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One named replicated state machine. Implementations live outside of the proposer; the
/// server shell applies committed commands to them in seqno order
pub trait StateMachine: Send + Sync {
	fn apply(&self, seqno: Seqno, payload: &[u8]);
}

/// Name-keyed registry of state machine implementations
/// Implementations are registered up front by the embedder; the committed configuration
/// decides which of them are live. Commands for anything else fail admission before they
/// ever reach a log
pub struct Registry {
	machines: HashMap<String, Arc<dyn StateMachine>>,
	live: BTreeMap<String, RsmConfig>
}

impl Registry {
	pub fn new() -> Registry {
		Registry { machines: HashMap::new(), live: BTreeMap::new() }
	}

	pub fn register(&mut self, name: &str, machine: Arc<dyn StateMachine>) {
		self.machines.insert(name.to_string(), machine);
	}

	/// Adopts the state machine set of a newly committed configuration
	pub fn sync_config(&mut self, config: &ConfigEntry) {
		self.live = config.state_machines().clone();
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn StateMachine>> {
		if !self.live.contains_key(name) {
			return None;
		}

		self.machines.get(name)
	}

	/// Routes one committed entry. Commands for machines that have since left the
	/// configuration are dropped; config entries retarget the registry itself
	pub fn dispatch(&mut self, entry: &LogEntry) {
		match &entry.data {
			EntryData::Command(cmd) => {
				if let Some(machine) = self.get(&cmd.rsm_name) {
					machine.apply(entry.seqno, &cmd.payload);
				}
			},
			other => {
				if let Some(config) = other.as_config() {
					self.sync_config(&config);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::sync::Mutex;

	/// Minimal in-memory key-value machine, enough to see commands land
	struct MemoryKv {
		data: Mutex<HashMap<Vec<u8>, Vec<u8>>>
	}

	impl MemoryKv {
		fn new() -> MemoryKv {
			MemoryKv { data: Mutex::new(HashMap::new()) }
		}
	}

	impl StateMachine for MemoryKv {
		fn apply(&self, _seqno: Seqno, payload: &[u8]) {
			// payload is 'key=value'
			let mut parts = payload.splitn(2, |b| *b == b'=');
			let key = parts.next().unwrap_or(b"").to_vec();
			let value = parts.next().unwrap_or(b"").to_vec();
			self.data.lock().unwrap().insert(key, value);
		}
	}

	fn command_entry(seqno: Seqno, rsm: &str, payload: &[u8]) -> LogEntry {
		LogEntry {
			history_id: "h".to_string(),
			term: Term::new(1, "a"),
			seqno,
			data: EntryData::Command(RsmCommand { rsm_name: rsm.to_string(), payload: payload.to_vec() })
		}
	}

	#[test]
	fn registry_test() {
		let kv = Arc::new(MemoryKv::new());

		let mut registry = Registry::new();
		registry.register("kv", kv.clone());

		let mut machines = BTreeMap::new();
		machines.insert("kv".to_string(), vec![]);
		registry.sync_config(&ConfigEntry::Stable(ConfigData {
			voters: HashSet::new(), state_machines: machines
		}));

		registry.dispatch(&command_entry(1, "kv", b"x=1"));

		// Commands for unknown machines go nowhere
		registry.dispatch(&command_entry(2, "other", b"y=2"));

		let data = kv.data.lock().unwrap();
		assert_eq!(data.get(&b"x"[..].to_vec()).unwrap(), &b"1".to_vec());
		assert_eq!(data.len(), 1);
	}

	#[test]
	fn registry_unconfigured_test() {
		let mut registry = Registry::new();
		registry.register("kv", Arc::new(MemoryKv::new()));

		// Registered but not in any committed config yet
		assert!(registry.get("kv").is_none());
	}
}
