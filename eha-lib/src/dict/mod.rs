//! Read-only telemetry dictionary model.
//!
//! Everything here is built once at startup from a dictionary source and
//! never mutated afterward, so definitions are shared as `Arc`s and are safe
//! for concurrent read. Parsing of flight dictionary file formats lives
//! outside this crate; [`InMemoryDictionary`](provider::InMemoryDictionary)
//! is the provider implementation embedders and tests populate directly or
//! from a JSON snapshot.
mod decom;
mod derivation;
mod provider;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use decom::{
    AlgorithmCall, BooleanField, ChannelField, ChannelRef, DecomMapDefinition, DecomMapId,
    DecomStatement, DynamicArrayField, EnumField, EvrField, FloatField, IntegerField,
    MapReference, OpcodeField, StaticArrayField, TextField, TimeField,
};
pub use derivation::{AlgorithmicDefinition, BitRange, BitUnpackDefinition};
pub use provider::{
    ApidMapEntry, ApidMembership, ChannelDefinitionProvider, DecomMapProvider,
    DerivationProvider, DictionarySnapshot, EvrDefinitionProvider, InMemoryDictionary,
};

/// Channel identifier, e.g. `A-0001` or `M-1056`.
pub type ChannelId = String;

/// Data interpretation of a channel's DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    SignedInt,
    UnsignedInt,
    Float,
    Ascii,
    /// Unsigned integer displayed through an enumeration table.
    Status,
    /// Unsigned integer displayed as a bit pattern.
    Digital,
    Boolean,
    Time,
}

impl ChannelType {
    /// True for types whose DN is meaningfully numeric, and which may
    /// therefore carry an EU.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ChannelType::Ascii | ChannelType::Boolean)
    }
}

/// Where a channel definition comes from, which also constrains where its
/// values may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDefinitionType {
    #[default]
    Flight,
    /// DSN station monitor channel. The only definition type whose LAD
    /// entries are segregated by station.
    Monitor,
    Header,
    SseHeader,
}

impl ChannelDefinitionType {
    #[must_use]
    pub fn is_monitor(&self) -> bool {
        matches!(self, ChannelDefinitionType::Monitor)
    }

    #[must_use]
    pub fn is_header(&self) -> bool {
        matches!(
            self,
            ChannelDefinitionType::Header | ChannelDefinitionType::SseHeader
        )
    }
}

/// DN to EU conversion declared by the dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnToEu {
    /// `eu = c0 + c1*dn + c2*dn^2 + ...`
    Polynomial { coefficients: Vec<f64> },
    /// Piecewise-linear interpolation over sorted DN points.
    Table { dn: Vec<f64>, eu: Vec<f64> },
    /// User algorithm resolved by id from the registered calculators.
    Algorithm { id: String },
}

/// Which binary header a header channel is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFieldKind {
    Packet,
    Frame,
    Sfdu,
}

/// One source a header channel can be extracted from. A channel may carry
/// several sources, e.g. a packet header field that is also present in the
/// SFDU envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFieldSource {
    pub kind: HeaderFieldKind,
    pub field: String,
}

/// Immutable dictionary entry for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub id: ChannelId,
    #[serde(default)]
    pub title: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub definition_type: ChannelDefinitionType,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub dn_format: Option<String>,
    #[serde(default)]
    pub eu_format: Option<String>,
    #[serde(default)]
    pub dn_to_eu: Option<DnToEu>,
    /// DN to symbolic state lookup for status channels.
    #[serde(default)]
    pub states: BTreeMap<i64, String>,
    /// Monitor dictionary index (the 12-bit channel number on the wire).
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub header_fields: Vec<HeaderFieldSource>,
}

impl ChannelDefinition {
    /// Minimal definition used pervasively by tests and by embedders that
    /// build dictionaries programmatically.
    #[must_use]
    pub fn new(id: &str, channel_type: ChannelType) -> Self {
        ChannelDefinition {
            id: id.to_string(),
            title: String::new(),
            channel_type,
            definition_type: ChannelDefinitionType::default(),
            units: String::new(),
            dn_format: None,
            eu_format: None,
            dn_to_eu: None,
            states: BTreeMap::new(),
            index: None,
            header_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_definition_type(mut self, dt: ChannelDefinitionType) -> Self {
        self.definition_type = dt;
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn with_dn_to_eu(mut self, conv: DnToEu) -> Self {
        self.dn_to_eu = Some(conv);
        self
    }

    #[must_use]
    pub fn with_header_field(mut self, kind: HeaderFieldKind, field: &str) -> Self {
        self.header_fields.push(HeaderFieldSource {
            kind,
            field: field.to_string(),
        });
        self
    }

    #[must_use]
    pub fn has_eu(&self) -> bool {
        self.dn_to_eu.is_some() && self.channel_type.is_numeric()
    }

    #[must_use]
    pub fn state_for(&self, dn: i64) -> Option<&str> {
        self.states.get(&dn).map(String::as_str)
    }

    /// The source field for a header kind, if this channel has one.
    #[must_use]
    pub fn header_field(&self, kind: HeaderFieldKind) -> Option<&str> {
        self.header_fields
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.field.as_str())
    }
}

/// Dictionary entry for one event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvrDefinition {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub level: String,
    /// printf-style message template; `%s` placeholders are replaced by the
    /// extracted arguments in order.
    #[serde(default)]
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_types() {
        assert!(ChannelType::SignedInt.is_numeric());
        assert!(ChannelType::Status.is_numeric());
        assert!(!ChannelType::Ascii.is_numeric());
        assert!(!ChannelType::Boolean.is_numeric());
    }

    #[test]
    fn definition_json_round_trip() {
        let def = ChannelDefinition::new("M-1056", ChannelType::UnsignedInt)
            .with_definition_type(ChannelDefinitionType::Monitor)
            .with_index(5)
            .with_dn_to_eu(DnToEu::Polynomial {
                coefficients: vec![0.0, 2.0],
            });
        let text = serde_json::to_string(&def).unwrap();
        let back: ChannelDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "M-1056");
        assert_eq!(back.index, Some(5));
        assert!(back.definition_type.is_monitor());
        assert!(back.has_eu());
    }

    #[test]
    fn header_field_lookup() {
        let def = ChannelDefinition::new("H-0003", ChannelType::UnsignedInt)
            .with_definition_type(ChannelDefinitionType::Header)
            .with_header_field(HeaderFieldKind::Packet, "apid")
            .with_header_field(HeaderFieldKind::Sfdu, "apid");
        assert_eq!(def.header_field(HeaderFieldKind::Packet), Some("apid"));
        assert_eq!(def.header_field(HeaderFieldKind::Frame), None);
    }
}
