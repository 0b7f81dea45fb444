use super::errors::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde as rmps;

/// Wire encoding for everything in protos. The server shell runs message bodies and log
/// entries through these before they touch a socket or a disk
pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	Ok(rmps::to_vec(obj)?)
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	Ok(rmps::from_slice(data)?)
}
