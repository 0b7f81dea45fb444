use super::protos::*;

use std::collections::HashSet;

/// Boolean requirement over sets of peers. Evaluated recursively; the nesting depth is
/// bounded by configuration transitions so this never gets deeper than about two levels
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Quorum {
	/// Every peer in the set must acknowledge
	All(HashSet<Peer>),

	/// A strict majority of the set must acknowledge
	Majority(HashSet<Peer>),

	/// Both sub-quorums must hold
	Joint(Box<Quorum>, Box<Quorum>)
}

/// Whether the given set of votes satisfies the quorum
pub fn have_quorum(votes: &HashSet<Peer>, quorum: &Quorum) -> bool {
	match quorum {
		Quorum::All(set) => set.iter().all(|p| votes.contains(p)),
		Quorum::Majority(set) => {
			let count = set.iter().filter(|p| votes.contains(*p)).count();
			2 * count > set.len()
		},
		Quorum::Joint(a, b) => have_quorum(votes, a) && have_quorum(votes, b)
	}
}

/// Whether some subset of the peers that have not failed could still satisfy the quorum.
/// Because quorum satisfaction is monotone in the vote set, this is just have_quorum over
/// everything that is left
pub fn is_feasible(peers: &HashSet<Peer>, failed: &HashSet<Peer>, quorum: &Quorum) -> bool {
	let remaining: HashSet<Peer> = peers.difference(failed).cloned().collect();
	have_quorum(&remaining, quorum)
}

/// Union of every peer set appearing anywhere in the expression
pub fn quorum_peers(quorum: &Quorum) -> HashSet<Peer> {
	let mut out = HashSet::new();
	collect_peers(quorum, &mut out);
	out
}

fn collect_peers(quorum: &Quorum, out: &mut HashSet<Peer>) {
	match quorum {
		Quorum::All(set) | Quorum::Majority(set) => {
			for p in set {
				out.insert(p.clone());
			}
		},
		Quorum::Joint(a, b) => {
			collect_peers(a, out);
			collect_peers(b, out);
		}
	}
}

/// Rewrites every occurrence of our own concrete name to the Local alias
pub fn translate(quorum: &Quorum, name: &str) -> Quorum {
	match quorum {
		Quorum::All(set) => Quorum::All(translate_set(set, name)),
		Quorum::Majority(set) => Quorum::Majority(translate_set(set, name)),
		Quorum::Joint(a, b) => Quorum::Joint(
			Box::new(translate(a, name)), Box::new(translate(b, name))
		)
	}
}

fn translate_set(set: &HashSet<Peer>, name: &str) -> HashSet<Peer> {
	set.iter().map(|p| {
		match p {
			Peer::Named(n) if n == name => Peer::Local,
			other => other.clone()
		}
	}).collect()
}

/// The quorum a configuration asks for: a plain majority when stable, the conjunction of
/// both majorities while a transition is in flight
pub fn config_quorum(config: &ConfigEntry) -> Quorum {
	match config {
		ConfigEntry::Stable(c) => Quorum::Majority(c.voters.clone()),
		ConfigEntry::Transition { current, future } => Quorum::Joint(
			Box::new(Quorum::Majority(current.voters.clone())),
			Box::new(Quorum::Majority(future.voters.clone()))
		)
	}
}

/// Wraps a quorum so that local durability is always mandatory. Every effective quorum a
/// proposer uses has this shape, even while the local node is being removed
pub fn require_local(quorum: Quorum) -> Quorum {
	let mut only_us = HashSet::new();
	only_us.insert(Peer::Local);
	Quorum::Joint(Box::new(Quorum::All(only_us)), Box::new(quorum))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peers(names: &[&str]) -> HashSet<Peer> {
		names.iter().map(|n| Peer::named(n)).collect()
	}

	#[test]
	fn majority_test() {
		let q = Quorum::Majority(peers(&["a", "b", "c"]));

		assert!(!have_quorum(&peers(&[]), &q));
		assert!(!have_quorum(&peers(&["a"]), &q));
		assert!(have_quorum(&peers(&["a", "c"]), &q));
		assert!(have_quorum(&peers(&["a", "b", "c"]), &q));

		// Voters outside of the set never help
		assert!(!have_quorum(&peers(&["x", "y", "z"]), &q));
	}

	#[test]
	fn majority_even_test() {
		// With four peers, two votes are not enough
		let q = Quorum::Majority(peers(&["a", "b", "c", "d"]));
		assert!(!have_quorum(&peers(&["a", "b"]), &q));
		assert!(have_quorum(&peers(&["a", "b", "c"]), &q));
	}

	#[test]
	fn all_test() {
		let q = Quorum::All(peers(&["a", "b"]));
		assert!(!have_quorum(&peers(&["a"]), &q));
		assert!(have_quorum(&peers(&["a", "b"]), &q));
		assert!(have_quorum(&peers(&["a", "b", "c"]), &q));
	}

	#[test]
	fn joint_test() {
		let q = Quorum::Joint(
			Box::new(Quorum::Majority(peers(&["a", "b", "c"]))),
			Box::new(Quorum::Majority(peers(&["a", "b", "d"])))
		);

		// A majority of only one side is not a joint quorum
		assert!(!have_quorum(&peers(&["a", "c"]), &q));
		assert!(!have_quorum(&peers(&["c", "d"]), &q));
		assert!(have_quorum(&peers(&["a", "b"]), &q));
		assert!(have_quorum(&peers(&["a", "c", "d"]), &q));
	}

	#[test]
	fn feasible_test() {
		let all = peers(&["a", "b", "c"]);
		let q = Quorum::Majority(all.clone());

		assert!(is_feasible(&all, &peers(&[]), &q));
		assert!(is_feasible(&all, &peers(&["c"]), &q));
		assert!(!is_feasible(&all, &peers(&["b", "c"]), &q));
	}

	#[test]
	fn feasible_requires_local_test() {
		let q = require_local(Quorum::Majority(peers(&["a", "b", "c"])));
		let mut all = peers(&["a", "b", "c"]);
		all.insert(Peer::Local);

		let mut failed = HashSet::new();
		failed.insert(Peer::Local);

		// Without the local node nothing is ever feasible
		assert!(!is_feasible(&all, &failed, &q));
		assert!(is_feasible(&all, &peers(&["a"]), &q));
	}

	#[test]
	fn translate_test() {
		let q = Quorum::Joint(
			Box::new(Quorum::All(peers(&["a"]))),
			Box::new(Quorum::Majority(peers(&["a", "b", "c"])))
		);

		let t = translate(&q, "a");
		let ps = quorum_peers(&t);

		assert!(ps.contains(&Peer::Local));
		assert!(!ps.contains(&Peer::named("a")));
		assert!(ps.contains(&Peer::named("b")));

		// Votes recorded under the alias satisfy the translated expression
		let mut votes = peers(&["b"]);
		votes.insert(Peer::Local);
		assert!(have_quorum(&votes, &t));
	}

	#[test]
	fn config_quorum_test() {
		let stable = ConfigEntry::Stable(ConfigData {
			voters: peers(&["a", "b", "c"]),
			state_machines: std::collections::BTreeMap::new()
		});

		assert_eq!(config_quorum(&stable), Quorum::Majority(peers(&["a", "b", "c"])));

		let joint = ConfigEntry::Transition {
			current: ConfigData { voters: peers(&["a", "b", "c"]), state_machines: std::collections::BTreeMap::new() },
			future: ConfigData { voters: peers(&["a", "b", "d"]), state_machines: std::collections::BTreeMap::new() }
		};

		let q = config_quorum(&joint);
		assert!(have_quorum(&peers(&["a", "b"]), &q));
		assert!(!have_quorum(&peers(&["b", "c"]), &q));
		assert!(have_quorum(&peers(&["b", "c", "d"]), &q));
	}
}
