//! Inventory vectors, used to announce and request data from peers.
use std::fmt::{Display, Formatter};

/// The type of data an [`InvVect`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessBlock,
    WitnessTx,
}

impl InvType {
    /// Returns `true` if this inventory type refers to a block.
    pub const fn is_block(self) -> bool {
        matches!(self, Self::Block | Self::WitnessBlock)
    }

    /// Returns `true` if this inventory type refers to a transaction.
    pub const fn is_tx(self) -> bool {
        matches!(self, Self::Tx | Self::WitnessTx)
    }
}

/// An inventory vector, a typed hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: [u8; 32],
}

impl InvVect {
    /// Creates a new block [`InvVect`].
    pub const fn block(hash: [u8; 32]) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }

    /// Creates a new transaction [`InvVect`].
    pub const fn tx(hash: [u8; 32]) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash,
        }
    }
}

impl Display for InvVect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.inv_type, hex::encode(self.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_types_map_to_base_types() {
        assert!(InvType::WitnessBlock.is_block());
        assert!(InvType::WitnessTx.is_tx());
        assert!(!InvType::FilteredBlock.is_block());
        assert!(!InvType::Error.is_tx());
    }
}
