//! Decom map definitions: a tree of typed field statements the decom engine
//! walks against a bit buffer.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ChannelId, ChannelType};

pub type DecomMapId = String;

/// One decom map. Maps may reference other maps, optionally rebinding the
/// symbolic channel names used by the referenced map's channel statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomMapDefinition {
    pub id: DecomMapId,
    #[serde(default)]
    pub statements: Vec<DecomStatement>,
}

impl DecomMapDefinition {
    #[must_use]
    pub fn new(id: &str, statements: Vec<DecomStatement>) -> Self {
        DecomMapDefinition {
            id: id.to_string(),
            statements,
        }
    }
}

/// A field statement in a decom map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum DecomStatement {
    Integer(IntegerField),
    Float(FloatField),
    Text(TextField),
    Boolean(BooleanField),
    Enum(EnumField),
    Time(TimeField),
    Skip { bits: u32 },
    Channel(ChannelField),
    StaticArray(StaticArrayField),
    DynamicArray(DynamicArrayField),
    MapReference(MapReference),
    Algorithm(AlgorithmCall),
    Opcode(OpcodeField),
    EventRecord(EvrField),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegerField {
    pub name: String,
    pub bits: u32,
    #[serde(default)]
    pub unsigned: bool,
    /// Store the extracted value as a decom variable under `name`, making it
    /// available to dynamic array lengths and algorithm arguments.
    #[serde(default)]
    pub store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatField {
    pub name: String,
    /// 32 or 64.
    #[serde(default = "default_float_bits")]
    pub bits: u32,
}

fn default_float_bits() -> u32 {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextField {
    pub name: String,
    /// Length in bytes.
    pub length: u32,
    #[serde(default)]
    pub store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BooleanField {
    pub name: String,
    #[serde(default = "default_bool_bits")]
    pub bits: u32,
}

fn default_bool_bits() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumField {
    pub name: String,
    pub bits: u32,
    #[serde(default)]
    pub enum_name: String,
}

/// Sets or advances the listener's current SCLK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeField {
    /// When true the extracted SCLK is added to the current SCLK instead of
    /// replacing it.
    #[serde(default)]
    pub is_delta: bool,
    pub coarse_bits: u8,
    pub fine_bits: u8,
}

/// How a channel statement identifies its channel: a literal dictionary id,
/// or a symbolic name resolved through the map-reference binding stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRef {
    Id(ChannelId),
    Name(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelField {
    pub channel: ChannelRef,
    pub channel_type: ChannelType,
    pub width: u32,
    /// Absolute bit offset override. The cursor is restored afterward.
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticArrayField {
    pub count: u32,
    pub statements: Vec<DecomStatement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicArrayField {
    /// Decom variable holding the element count.
    pub length_variable: String,
    pub statements: Vec<DecomStatement>,
}

/// Execute another map in place, optionally rebinding symbolic channel
/// names for its duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapReference {
    pub map_id: DecomMapId,
    #[serde(default)]
    pub channel_bindings: BTreeMap<String, ChannelId>,
}

/// Hand the buffer to a custom decommutator algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmCall {
    pub algorithm_id: String,
    /// Argument name to decom-variable name.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcodeField {
    #[serde(default = "default_opcode_bits")]
    pub bits: u32,
}

fn default_opcode_bits() -> u32 {
    16
}

/// An embedded event record: an EVR id followed by fixed-width arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvrField {
    #[serde(default = "default_evr_id_bits")]
    pub id_bits: u32,
    #[serde(default)]
    pub arg_widths: Vec<u32>,
}

fn default_evr_id_bits() -> u32 {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_json_round_trip() {
        let map = DecomMapDefinition::new(
            "power",
            vec![
                DecomStatement::Integer(IntegerField {
                    name: "count".into(),
                    bits: 8,
                    unsigned: true,
                    store: true,
                }),
                DecomStatement::DynamicArray(DynamicArrayField {
                    length_variable: "count".into(),
                    statements: vec![DecomStatement::Channel(ChannelField {
                        channel: ChannelRef::Name("bus_voltage".into()),
                        channel_type: ChannelType::UnsignedInt,
                        width: 16,
                        offset: None,
                    })],
                }),
            ],
        );
        let text = serde_json::to_string(&map).unwrap();
        let back: DecomMapDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "power");
        assert_eq!(back.statements.len(), 2);
        match &back.statements[1] {
            DecomStatement::DynamicArray(arr) => assert_eq!(arr.length_variable, "count"),
            other => panic!("unexpected statement {other:?}"),
        }
    }
}
