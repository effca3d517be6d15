//! Derivation definitions: how secondary channels are produced from
//! primary ones.
use serde::{Deserialize, Serialize};

use super::ChannelId;

/// A contiguous bit slice of a parent DN. `start_bit` counts from the least
/// significant bit of the parent's integer DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRange {
    pub start_bit: u32,
    pub length: u32,
}

/// Single parent, single child derivation that extracts and concatenates
/// bit slices of the parent DN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitUnpackDefinition {
    pub id: String,
    pub parent: ChannelId,
    pub child: ChannelId,
    /// Slices are concatenated most significant first, in declaration
    /// order.
    pub ranges: Vec<BitRange>,
}

/// N-parent, M-child derivation executed by a user algorithm.
///
/// In trigger mode `trigger_id` names the channel whose arrival fires the
/// derivation; it does not have to be one of the parents. Without a trigger
/// the derivation fires whenever any parent arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmicDefinition {
    pub id: String,
    #[serde(default)]
    pub trigger_id: Option<ChannelId>,
    pub parents: Vec<ChannelId>,
    pub children: Vec<ChannelId>,
    pub algorithm_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_unpack_json() {
        let text = r#"{
            "id": "unpack-flags",
            "parent": "A-0100",
            "child": "A-0101",
            "ranges": [{"start_bit": 4, "length": 2}]
        }"#;
        let def: BitUnpackDefinition = serde_json::from_str(text).unwrap();
        assert_eq!(def.ranges, vec![BitRange { start_bit: 4, length: 2 }]);
    }
}
