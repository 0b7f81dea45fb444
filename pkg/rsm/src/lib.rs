#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;

extern crate serde;
extern crate rmp_serde as rmps;


pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
			Encode(rmp_serde::encode::Error);
			Decode(rmp_serde::decode::Error);
		}
	}
}

pub mod protos;
pub mod quorum;
pub mod rpc;
pub mod state_machine;

pub mod log;
pub mod state; // TODO: Eventually make this private again
pub mod config_state;
pub mod sync;
pub mod catchup;
pub mod proposer;
