use crate::types::{Destination, Funds};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How an allocation's amount may be paid out by the adjudicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationType {
    /// Paid directly to the destination.
    #[default]
    Simple,
    /// Held back as a guarantee for a funded target channel, reclaimable
    /// once the target finalizes.
    Guarantee,
}

/// A single slice of an asset's outcome: who gets how much.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn simple(destination: Destination, amount: U256) -> Self {
        Allocation { destination, amount, allocation_type: AllocationType::Simple, metadata: Vec::new() }
    }
}

/// The outcome of one asset: an ordered list of allocations. Order matters;
/// with partial funding the adjudicator pays allocations from the front of
/// the list first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleAssetExit {
    pub asset: Address,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub metadata: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    pub fn total_allocated(&self) -> U256 {
        self.allocations.iter().fold(U256::ZERO, |acc, a| acc + a.amount)
    }
}

/// A full outcome: one entry per asset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    /// The total amount allocated per asset.
    pub fn total_allocated(&self) -> Funds {
        self.0.iter().map(|sae| (sae.asset, sae.total_allocated())).collect()
    }

    /// The total amount allocated to `destination` per asset.
    pub fn total_allocated_for(&self, destination: Destination) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let total = sae
                .allocations
                .iter()
                .filter(|a| a.destination == destination)
                .fold(U256::ZERO, |acc, a| acc + a.amount);
            funds.insert(sae.asset, total);
        }
        funds
    }

    /// Returns true iff, for every asset in `allocation_map`, the supplied
    /// funding covers every allocation up to and including the given one in
    /// this outcome's payout order.
    ///
    /// Returns false if an asset in the map has no matching allocation in
    /// this outcome, or has no funding entry.
    pub fn affords(&self, allocation_map: &BTreeMap<Address, Allocation>, funding: &Funds) -> bool {
        for sae in &self.0 {
            let Some(target) = allocation_map.get(&sae.asset) else {
                continue;
            };
            let Some(available) = funding.0.get(&sae.asset) else {
                return false;
            };
            let mut cumulative = U256::ZERO;
            let mut found = false;
            for allocation in &sae.allocations {
                cumulative += allocation.amount;
                if allocation == target {
                    found = true;
                    break;
                }
            }
            if !found || *available < cumulative {
                return false;
            }
        }
        // Every asset in the map must appear in the outcome.
        allocation_map.keys().all(|asset| self.0.iter().any(|sae| sae.asset == *asset))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn destination(byte: u8) -> Destination {
        Destination::from_address(Address::repeat_byte(byte))
    }

    fn two_party_exit() -> Exit {
        Exit(vec![SingleAssetExit {
            asset: Address::ZERO,
            metadata: vec![],
            allocations: vec![
                Allocation::simple(destination(0xaa), U256::from(5)),
                Allocation::simple(destination(0xbb), U256::from(7)),
            ],
        }])
    }

    #[test]
    fn totals() {
        let exit = two_party_exit();
        assert_eq!(exit.total_allocated().held(&Address::ZERO), U256::from(12));
        assert_eq!(exit.total_allocated_for(destination(0xbb)).held(&Address::ZERO), U256::from(7));
        assert_eq!(exit.total_allocated_for(destination(0xcc)).held(&Address::ZERO), U256::ZERO);
    }

    #[test]
    fn affords_respects_payout_order() {
        let exit = two_party_exit();
        let first: BTreeMap<_, _> =
            [(Address::ZERO, Allocation::simple(destination(0xaa), U256::from(5)))].into_iter().collect();
        let second: BTreeMap<_, _> =
            [(Address::ZERO, Allocation::simple(destination(0xbb), U256::from(7)))].into_iter().collect();

        let mut funding = Funds::new();
        funding.insert(Address::ZERO, U256::from(5));
        // The first allocation is covered, the second needs the full 12.
        assert!(exit.affords(&first, &funding));
        assert!(!exit.affords(&second, &funding));

        funding.insert(Address::ZERO, U256::from(12));
        assert!(exit.affords(&second, &funding));
    }

    #[test]
    fn affords_rejects_unknown_targets() {
        let exit = two_party_exit();
        let unknown: BTreeMap<_, _> =
            [(Address::ZERO, Allocation::simple(destination(0xcc), U256::from(1)))].into_iter().collect();
        let mut funding = Funds::new();
        funding.insert(Address::ZERO, U256::from(100));
        assert!(!exit.affords(&unknown, &funding));

        let missing_funding: BTreeMap<_, _> =
            [(Address::ZERO, Allocation::simple(destination(0xaa), U256::from(5)))].into_iter().collect();
        assert!(!exit.affords(&missing_funding, &Funds::new()));
    }
}
