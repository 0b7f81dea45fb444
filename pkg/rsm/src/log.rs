use super::errors::*;
use super::protos::*;

use std::collections::VecDeque;
use std::sync::Mutex;

/// Read and append surface of the local durable log
/// The proposer only ever reads through this; writes happen through the local agent like
/// for any other peer. The trait still exposes append/truncation so that embedders and
/// tests can drive a log directly
pub trait Log {
	/// Lowest seqno still retained. Everything below it has been compacted away and can
	/// only reach a peer through catchup
	fn first_seqno(&self) -> Seqno;

	/// Highest seqno appended so far, NO_SEQNO for an empty log
	fn last_seqno(&self) -> Seqno;

	fn entry(&self, seqno: Seqno) -> Option<LogEntry>;

	/// All entries in the inclusive range, or None if any of them is unavailable
	fn entries(&self, first: Seqno, last: Seqno) -> Option<Vec<LogEntry>>;

	fn append(&self, entry: LogEntry) -> Result<()>;

	/// Deletes every entry with seqno >= from
	fn truncate_suffix(&self, from: Seqno) -> Result<()>;
}

/// Fully in-memory log
pub struct MemoryLog {
	state: Mutex<MemoryLogState>
}

struct MemoryLogState {
	/// Seqno of entries[0]
	first: Seqno,

	entries: VecDeque<LogEntry>
}

impl MemoryLog {
	pub fn new() -> MemoryLog {
		MemoryLog {
			state: Mutex::new(MemoryLogState { first: 1, entries: VecDeque::new() })
		}
	}

	/// Replaces the whole log with a prefix restored from a snapshot transfer. The first
	/// entry, if any, must sit exactly at `first`
	pub fn install(&self, first: Seqno, entries: Vec<LogEntry>) {
		if let Some(front) = entries.first() {
			assert_eq!(front.seqno, first);
		}

		let mut s = self.state.lock().unwrap();
		s.first = first;
		s.entries = entries.into();
	}

	/// Simulates compaction by dropping every entry with seqno <= up_to
	pub fn truncate_prefix(&self, up_to: Seqno) {
		let mut s = self.state.lock().unwrap();
		while let Some(front) = s.entries.front() {
			if front.seqno > up_to {
				break;
			}

			s.entries.pop_front();
			s.first += 1;
		}

		if s.first <= up_to {
			s.first = up_to + 1;
		}
	}
}

impl Log for MemoryLog {
	fn first_seqno(&self) -> Seqno {
		self.state.lock().unwrap().first
	}

	fn last_seqno(&self) -> Seqno {
		let s = self.state.lock().unwrap();
		s.first + (s.entries.len() as Seqno) - 1
	}

	fn entry(&self, seqno: Seqno) -> Option<LogEntry> {
		let s = self.state.lock().unwrap();
		if seqno < s.first {
			return None;
		}

		s.entries.get((seqno - s.first) as usize).cloned()
	}

	fn entries(&self, first: Seqno, last: Seqno) -> Option<Vec<LogEntry>> {
		if first > last {
			return Some(vec![]);
		}

		let s = self.state.lock().unwrap();
		if first < s.first {
			return None;
		}

		let mut out = Vec::with_capacity((last - first + 1) as usize);
		for seqno in first..(last + 1) {
			out.push(s.entries.get((seqno - s.first) as usize)?.clone());
		}

		Some(out)
	}

	fn append(&self, entry: LogEntry) -> Result<()> {
		let mut s = self.state.lock().unwrap();

		let expected = s.first + (s.entries.len() as Seqno);
		if entry.seqno != expected {
			return Err(format!(
				"append out of order: got seqno {} while expecting {}", entry.seqno, expected
			).into());
		}

		s.entries.push_back(entry);
		Ok(())
	}

	fn truncate_suffix(&self, from: Seqno) -> Result<()> {
		let mut s = self.state.lock().unwrap();

		if from < s.first {
			return Err("refusing to truncate into the compacted prefix".into());
		}

		while let Some(back) = s.entries.back() {
			if back.seqno < from {
				break;
			}

			s.entries.pop_back();
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(seqno: Seqno) -> LogEntry {
		LogEntry {
			history_id: "h".to_string(),
			term: Term::new(1, "a"),
			seqno,
			data: EntryData::Command(RsmCommand { rsm_name: "kv".to_string(), payload: vec![seqno as u8] })
		}
	}

	#[test]
	fn memory_log_test() {
		let log = MemoryLog::new();
		assert_eq!(log.first_seqno(), 1);
		assert_eq!(log.last_seqno(), NO_SEQNO);

		for i in 1..5 {
			log.append(entry(i)).unwrap();
		}

		assert_eq!(log.last_seqno(), 4);
		assert_eq!(log.entry(2).unwrap().seqno, 2);
		assert_eq!(log.entries(2, 4).unwrap().len(), 3);
		assert!(log.entries(2, 5).is_none());

		// Out of order appends are rejected
		assert!(log.append(entry(7)).is_err());
	}

	#[test]
	fn truncate_suffix_test() {
		let log = MemoryLog::new();
		for i in 1..6 {
			log.append(entry(i)).unwrap();
		}

		log.truncate_suffix(3).unwrap();
		assert_eq!(log.last_seqno(), 2);
		assert!(log.entry(3).is_none());

		// The log stays appendable at the cut point
		log.append(entry(3)).unwrap();
		assert_eq!(log.last_seqno(), 3);
	}

	#[test]
	fn truncate_prefix_test() {
		let log = MemoryLog::new();
		for i in 1..6 {
			log.append(entry(i)).unwrap();
		}

		log.truncate_prefix(2);
		assert_eq!(log.first_seqno(), 3);
		assert!(log.entry(2).is_none());
		assert!(log.entries(2, 4).is_none());
		assert_eq!(log.entries(3, 5).unwrap().len(), 3);
	}
}
