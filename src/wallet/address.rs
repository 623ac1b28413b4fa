use bech32::{Bech32m, Hrp};
use thiserror::Error;

use crate::wallet::AddressType;

#[derive(Error, Debug)]
pub enum AddressError {
	#[error("invalid bech32 encoding: {0}")]
	Encoding(String),
	#[error("prefix `{0}` is neither shielded nor transparent")]
	UnknownPrefix(String),
	#[error("address carries no payload")]
	EmptyPayload,
}

const SHIELDED_PREFIX: &str = "zs";
const TRANSPARENT_PREFIX: &str = "zt";

/// Bech32m wallet address of the form `<kind>[_<network>]1...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAddress {
	pub kind: AddressType,
	/// Network suffix, `None` on mainnet
	pub network: Option<String>,
	pub data: Vec<u8>,
}

impl WalletAddress {
	pub fn decode(encoded: &str) -> Result<Self, AddressError> {
		let (hrp, data) =
			bech32::decode(encoded).map_err(|e| AddressError::Encoding(e.to_string()))?;
		let hrp = hrp.as_str().to_lowercase();
		let mut parts = hrp.split('_');
		let kind = match parts.next() {
			Some(SHIELDED_PREFIX) => AddressType::Shielded,
			Some(TRANSPARENT_PREFIX) => AddressType::Transparent,
			_ => return Err(AddressError::UnknownPrefix(hrp.clone())),
		};
		let network = parts.next().map(|s| s.to_string());
		if data.is_empty() {
			return Err(AddressError::EmptyPayload);
		}

		Ok(Self {
			kind,
			network,
			data,
		})
	}

	pub fn encode(&self) -> Result<String, AddressError> {
		let prefix = match self.kind {
			AddressType::Shielded => SHIELDED_PREFIX,
			AddressType::Transparent => TRANSPARENT_PREFIX,
		};
		let hrp = match &self.network {
			Some(network) => format!("{}_{}", prefix, network),
			None => prefix.to_string(),
		};
		let hrp = Hrp::parse(&hrp).map_err(|e| AddressError::Encoding(e.to_string()))?;

		bech32::encode::<Bech32m>(hrp, &self.data).map_err(|e| AddressError::Encoding(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse() {
		let encoded_str = bech32::encode::<Bech32m>(
			Hrp::parse("zs_test").expect("Failed while bech32 parsing"),
			&[1, 2, 3],
		)
		.expect("Failed while bech32 encoding");
		let address =
			WalletAddress::decode(&encoded_str).expect("Failed while decoding `WalletAddress`");
		assert_eq!(address.kind, AddressType::Shielded);
		assert_eq!(address.network, Some("test".to_string()));
		assert_eq!(address.data, vec![1u8, 2u8, 3u8]);
	}

	#[test]
	fn transparent_mainnet_address() {
		let address = WalletAddress {
			kind: AddressType::Transparent,
			network: None,
			data: vec![9; 20],
		};
		let encoded = address.encode().unwrap();
		assert!(encoded.starts_with("zt1"));
		assert_eq!(WalletAddress::decode(&encoded).unwrap(), address);
	}

	#[test]
	fn rejects_foreign_prefix() {
		let encoded = bech32::encode::<Bech32m>(Hrp::parse("bc").unwrap(), &[1, 2]).unwrap();
		assert!(matches!(
			WalletAddress::decode(&encoded),
			Err(AddressError::UnknownPrefix(_))
		));
	}

	#[test]
	fn rejects_garbage() {
		assert!(matches!(
			WalletAddress::decode("not an address"),
			Err(AddressError::Encoding(_))
		));
	}
}
