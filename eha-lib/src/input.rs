//! Inbound processing unit contracts.
//!
//! These are the messages the core consumes from the transport: one struct
//! per subscribed topic, each exposing raw bytes, parsed envelope/header
//! accessors, timestamps, station/VCID metadata, and a lineage id.
use hifitime::Epoch;

use crate::sfdu::ChdoSfdu;
use crate::time::Sclk;
use crate::value::{StationId, UnitId};
use crate::{Apid, Vcid};

/// A telemetry packet has arrived. `data` holds the complete packet,
/// primary header included.
#[derive(Debug, Clone)]
pub struct PacketArrived {
    pub data: Vec<u8>,
    pub ert: Option<Epoch>,
    pub scet: Option<Epoch>,
    pub sclk: Option<Sclk>,
    pub station: StationId,
    pub vcid: Option<Vcid>,
    pub unit_id: UnitId,
    pub realtime: bool,
    pub is_fill: bool,
    /// The SFDU envelope the packet arrived in, when the input stream
    /// carries one.
    pub sfdu: Option<ChdoSfdu>,
}

impl PacketArrived {
    #[must_use]
    pub fn apid(&self) -> Option<Apid> {
        crate::header::CcsdsPacketHeader::decode(&self.data).map(|h| h.apid)
    }
}

/// A transfer frame has arrived. `data` holds the complete frame.
#[derive(Debug, Clone)]
pub struct FrameArrived {
    pub data: Vec<u8>,
    pub ert: Option<Epoch>,
    pub station: StationId,
    pub vcid: Option<Vcid>,
    pub unit_id: UnitId,
    pub realtime: bool,
    pub is_idle: bool,
    pub sfdu: Option<ChdoSfdu>,
}

/// A DSN station monitor record has arrived.
#[derive(Debug, Clone)]
pub struct MonitorArrived {
    pub sfdu: ChdoSfdu,
    pub unit_id: UnitId,
}

/// A NEN station status record has arrived. Status records are decommed by
/// map, selected by `map_id` from the station configuration.
#[derive(Debug, Clone)]
pub struct StationStatusArrived {
    pub data: Vec<u8>,
    pub map_id: String,
    pub ert: Option<Epoch>,
    pub station: StationId,
    pub unit_id: UnitId,
}
