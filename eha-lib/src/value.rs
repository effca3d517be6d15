//! The in-memory representation of one telemetry sample.
use std::fmt::Display;
use std::sync::Arc;

use derive_more::From;
use hifitime::Epoch;
use serde::{Deserialize, Serialize};

use crate::dict::{ChannelDefinition, ChannelDefinitionType, ChannelType};
use crate::time::{LocalSolarTime, Sclk};

/// Identifier of the ground station (DSS id) a sample was received through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StationId(pub u16);

impl StationId {
    /// Sentinel for samples not associated with a particular station. All
    /// non-monitor values carry this.
    pub const UNSPECIFIED: StationId = StationId(0);

    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lineage id of the packet, frame, or station record a value came from.
pub type UnitId = u64;

/// Raw data number of a sample.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum Dn {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl From<&str> for Dn {
    fn from(s: &str) -> Self {
        Dn::Text(s.to_string())
    }
}

impl Dn {
    /// Numeric view of the DN; `None` for text.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Dn::Signed(v) => Some(*v as f64),
            Dn::Unsigned(v) => Some(*v as f64),
            Dn::Float(v) => Some(*v),
            Dn::Boolean(v) => Some(u8::from(*v).into()),
            Dn::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Dn::Signed(v) => Some(*v),
            Dn::Unsigned(v) => i64::try_from(*v).ok(),
            Dn::Float(v) => Some(*v as i64),
            Dn::Boolean(v) => Some(i64::from(*v)),
            Dn::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Dn::Signed(v) => u64::try_from(*v).ok(),
            Dn::Unsigned(v) => Some(*v),
            Dn::Float(v) => {
                if *v >= 0.0 {
                    Some(*v as u64)
                } else {
                    None
                }
            }
            Dn::Boolean(v) => Some(u64::from(*v)),
            Dn::Text(_) => None,
        }
    }
}

impl Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dn::Signed(v) => write!(f, "{v}"),
            Dn::Unsigned(v) => write!(f, "{v}"),
            Dn::Float(v) => write!(f, "{v}"),
            Dn::Text(v) => write!(f, "{v}"),
            Dn::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Alarm disposition of a sample's DN or EU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    #[default]
    None,
    Yellow,
    Red,
}

impl Display for AlarmLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlarmLevel::None => write!(f, ""),
            AlarmLevel::Yellow => write!(f, "YELLOW"),
            AlarmLevel::Red => write!(f, "RED"),
        }
    }
}

/// What part of the downlink a sample was channelized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelCategory {
    #[default]
    Flight,
    PacketHeader,
    FrameHeader,
    SsePacketHeader,
    Monitor,
}

/// One time-tagged channel sample.
///
/// Created by an extractor or decom listener; the publisher back-fills any
/// timestamp, station, or VCID left unset before the value reaches the LAD
/// or the bus, after which it is not modified again.
#[derive(Debug, Clone)]
pub struct ChannelValue {
    def: Arc<ChannelDefinition>,
    pub dn: Dn,
    pub eu: Option<f64>,
    pub realtime: bool,
    pub station: StationId,
    pub vcid: Option<crate::Vcid>,
    pub sclk: Option<Sclk>,
    pub scet: Option<Epoch>,
    pub ert: Option<Epoch>,
    pub rct: Option<Epoch>,
    pub lst: Option<LocalSolarTime>,
    pub unit_id: Option<UnitId>,
    pub dn_alarm: AlarmLevel,
    pub eu_alarm: AlarmLevel,
    pub category: ChannelCategory,
}

impl ChannelValue {
    #[must_use]
    pub fn new(def: Arc<ChannelDefinition>, dn: Dn) -> Self {
        let category = match def.definition_type {
            ChannelDefinitionType::Monitor => ChannelCategory::Monitor,
            _ => ChannelCategory::Flight,
        };
        ChannelValue {
            def,
            dn,
            eu: None,
            realtime: true,
            station: StationId::UNSPECIFIED,
            vcid: None,
            sclk: None,
            scet: None,
            ert: None,
            rct: None,
            lst: None,
            unit_id: None,
            dn_alarm: AlarmLevel::default(),
            eu_alarm: AlarmLevel::default(),
            category,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.def.id
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<ChannelDefinition> {
        &self.def
    }

    #[must_use]
    pub fn definition_type(&self) -> ChannelDefinitionType {
        self.def.definition_type
    }

    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        self.def.channel_type
    }

    /// True if the definition declares an EU conversion applicable to this
    /// sample.
    #[must_use]
    pub fn has_eu(&self) -> bool {
        self.def.has_eu()
    }

    #[must_use]
    pub fn with_category(mut self, category: ChannelCategory) -> Self {
        self.category = category;
        self
    }
}

impl Display for ChannelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.def.id, self.dn)?;
        if let Some(eu) = self.eu {
            write!(f, " ({eu})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dn_conversions() {
        assert_eq!(Dn::from(42u64).as_f64(), Some(42.0));
        assert_eq!(Dn::from(-7i64).as_i64(), Some(-7));
        assert_eq!(Dn::from(-7i64).as_u64(), None);
        assert_eq!(Dn::from(true).as_u64(), Some(1));
        assert_eq!(Dn::from("abc").as_f64(), None);
    }

    #[test]
    fn monitor_category_tagging() {
        let def = Arc::new(
            ChannelDefinition::new("M-0001", ChannelType::UnsignedInt)
                .with_definition_type(ChannelDefinitionType::Monitor),
        );
        let val = ChannelValue::new(def, Dn::Unsigned(1));
        assert_eq!(val.category, ChannelCategory::Monitor);

        let def = Arc::new(ChannelDefinition::new("A-0001", ChannelType::UnsignedInt));
        let val = ChannelValue::new(def, Dn::Unsigned(1));
        assert_eq!(val.category, ChannelCategory::Flight);
    }
}
