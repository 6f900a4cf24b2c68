use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

/// A 32-byte destination for channel funds.
///
/// A destination is either a channel id (the hash of a channel's fixed
/// parameters) or an external Ethereum address left-padded with twelve zero
/// bytes. The adjudicator pays external destinations out directly and treats
/// channel ids as further allocation targets.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Destination(pub B256);

impl Destination {
    pub const fn zero() -> Self {
        Destination(B256::ZERO)
    }

    /// Left-pads an external address into a destination.
    pub fn from_address(address: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address.as_slice());
        Destination(B256::from(bytes))
    }

    /// Returns true if the first twelve bytes are zero, i.e. the destination
    /// could be an external address rather than a channel id.
    pub fn is_external(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0 .0
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Destination({self})")
    }
}

/// Per-asset amounts, keyed by the asset's token address. The zero address
/// denotes the chain's native token.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Funds(pub BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Self {
        Funds(BTreeMap::new())
    }

    /// The amount held for `asset`, zero if the asset is unknown.
    pub fn held(&self, asset: &Address) -> U256 {
        self.0.get(asset).copied().unwrap_or(U256::ZERO)
    }

    pub fn insert(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }

    /// True if any asset has a non-zero amount.
    pub fn is_non_zero(&self) -> bool {
        self.0.values().any(|amount| *amount > U256::ZERO)
    }

    /// True if, for every asset in `required`, this holds at least as much.
    pub fn covers(&self, required: &Funds) -> bool {
        required.0.iter().all(|(asset, amount)| self.held(asset) >= *amount)
    }

    /// The per-asset amount still missing to reach `target` from this level.
    /// Assets already at or above target are omitted from the result.
    pub fn shortfall_to(&self, target: &Funds) -> Funds {
        let mut missing = Funds::new();
        for (asset, amount) in &target.0 {
            let held = self.held(asset);
            if held < *amount {
                missing.insert(*asset, amount - held);
            }
        }
        missing
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.0.iter()
    }
}

impl Display for Funds {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(asset, amount)| format!("{amount} of {asset}")).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromIterator<(Address, U256)> for Funds {
    fn from_iter<I: IntoIterator<Item = (Address, U256)>>(iter: I) -> Self {
        Funds(iter.into_iter().collect())
    }
}
