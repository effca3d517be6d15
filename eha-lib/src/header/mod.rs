//! Binary header channelization: packet and frame headers decoded at fixed
//! offsets and emitted as header-category channel values.
mod sfdu;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::dict::{
    ChannelDefinition, ChannelId, HeaderFieldKind,
};
use crate::input::{FrameArrived, PacketArrived};
use crate::publish::{ChannelPublisher, PublishContext};
use crate::time::wall_clock_now;
use crate::value::{ChannelCategory, ChannelValue, Dn};
use crate::{Apid, Scid, Vcid};

pub use sfdu::{restrict_sfdu_vcid, EnvelopeFilter, SfduHeaderChannelizer};

/// CCSDS space packet primary header.
#[derive(Debug, Copy, Clone)]
pub struct CcsdsPacketHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    pub sequence_flags: u8,
    pub sequence_id: u16,
    pub len_minus1: u16,
}

impl CcsdsPacketHeader {
    /// Size of the primary header.
    pub const LEN: usize = 6;

    /// Decode from bytes. Returns `None` if there are not enough bytes to
    /// construct the header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Some(CcsdsPacketHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Header field by dictionary name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Dn> {
        match name {
            "version" => Some(Dn::Unsigned(u64::from(self.version))),
            "type" => Some(Dn::Unsigned(u64::from(self.type_flag))),
            "secondary_header_flag" => Some(Dn::Boolean(self.has_secondary_header)),
            "apid" => Some(Dn::Unsigned(u64::from(self.apid))),
            "sequence_flags" => Some(Dn::Unsigned(u64::from(self.sequence_flags))),
            "sequence_count" => Some(Dn::Unsigned(u64::from(self.sequence_id))),
            "packet_length" => Some(Dn::Unsigned(u64::from(self.len_minus1))),
            _ => None,
        }
    }
}

/// Transfer frame (VCDU) header.
#[derive(Debug, Copy, Clone)]
pub struct TmFrameHeader {
    pub version: u8,
    pub scid: Scid,
    pub vcid: Vcid,
    pub counter: u32,
    pub replay: bool,
}

impl TmFrameHeader {
    /// Frame header length in bytes.
    pub const LEN: usize = 6;
    /// VCID indicating an idle/fill frame.
    pub const FILL: Vcid = 63;

    /// Construct from the provided bytes, or `None` if there are not
    /// enough bytes.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        let x = u16::from_be_bytes([dat[0], dat[1]]);
        Some(TmFrameHeader {
            version: (dat[0] >> 6) & 0x3,
            scid: (x >> 6) & 0xff,
            vcid: x & 0x3f,
            counter: u32::from_be_bytes([0, dat[2], dat[3], dat[4]]),
            replay: (dat[5] >> 7) & 0x1 == 1,
        })
    }

    /// Header field by dictionary name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Dn> {
        match name {
            "version" => Some(Dn::Unsigned(u64::from(self.version))),
            "scid" => Some(Dn::Unsigned(u64::from(self.scid))),
            "vcid" => Some(Dn::Unsigned(u64::from(self.vcid))),
            "counter" => Some(Dn::Unsigned(u64::from(self.counter))),
            "replay" => Some(Dn::Boolean(self.replay)),
            _ => None,
        }
    }
}

/// Header channel routing table: which dictionary channel each packet,
/// frame, or SFDU field feeds, plus the overlaps between them.
///
/// Invariant: when SFDU envelopes are present for an input type, the
/// packet/frame-header source of an overlapping field is disabled so the
/// field is channelized exactly once, from the SFDU.
#[derive(Default)]
pub struct HeaderChannelTable {
    packet_fields: HashMap<String, Arc<ChannelDefinition>>,
    frame_fields: HashMap<String, Arc<ChannelDefinition>>,
    sfdu_fields: HashMap<String, Arc<ChannelDefinition>>,
    /// Packet-header fields whose channel is also derivable from the SFDU.
    packet_overlaps: HashMap<String, ChannelId>,
    frame_overlaps: HashMap<String, ChannelId>,
}

impl HeaderChannelTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every header-sourced channel in `defs`.
    pub fn add_definitions<I>(&mut self, defs: I)
    where
        I: IntoIterator<Item = Arc<ChannelDefinition>>,
    {
        for def in defs {
            if !def.definition_type.is_header() {
                continue;
            }
            for source in &def.header_fields {
                let map = match source.kind {
                    HeaderFieldKind::Packet => &mut self.packet_fields,
                    HeaderFieldKind::Frame => &mut self.frame_fields,
                    HeaderFieldKind::Sfdu => &mut self.sfdu_fields,
                };
                map.insert(source.field.clone(), Arc::clone(&def));
            }
        }
        // A channel reachable both from a packet/frame header and from the
        // SFDU envelope is an overlap.
        for (field, def) in &self.packet_fields {
            if self.sfdu_fields.values().any(|d| d.id == def.id) {
                self.packet_overlaps.insert(field.clone(), def.id.clone());
            }
        }
        for (field, def) in &self.frame_fields {
            if self.sfdu_fields.values().any(|d| d.id == def.id) {
                self.frame_overlaps.insert(field.clone(), def.id.clone());
            }
        }
    }

    #[must_use]
    pub fn packet_fields(&self) -> &HashMap<String, Arc<ChannelDefinition>> {
        &self.packet_fields
    }

    #[must_use]
    pub fn frame_fields(&self) -> &HashMap<String, Arc<ChannelDefinition>> {
        &self.frame_fields
    }

    #[must_use]
    pub fn sfdu_fields(&self) -> &HashMap<String, Arc<ChannelDefinition>> {
        &self.sfdu_fields
    }

    /// Disable the packet- or frame-header source of every channel that the
    /// SFDU envelope also provides. Called once when SFDU envelopes are
    /// seen on the given input kind.
    pub fn disable_overlapping(&mut self, kind: HeaderFieldKind) {
        match kind {
            HeaderFieldKind::Packet => {
                for field in self.packet_overlaps.keys() {
                    if self.packet_fields.remove(field).is_some() {
                        debug!(%field, "packet header source disabled in favor of SFDU");
                    }
                }
            }
            HeaderFieldKind::Frame => {
                for field in self.frame_overlaps.keys() {
                    if self.frame_fields.remove(field).is_some() {
                        debug!(%field, "frame header source disabled in favor of SFDU");
                    }
                }
            }
            HeaderFieldKind::Sfdu => {}
        }
    }
}

/// Channelizes packet primary headers.
pub struct PacketHeaderChannelizer {
    table: Arc<Mutex<HeaderChannelTable>>,
    publisher: Arc<ChannelPublisher>,
    /// Channelize fill packets too. Off by default.
    publish_fill: bool,
}

impl PacketHeaderChannelizer {
    #[must_use]
    pub fn new(
        table: Arc<Mutex<HeaderChannelTable>>,
        publisher: Arc<ChannelPublisher>,
        publish_fill: bool,
    ) -> Self {
        PacketHeaderChannelizer {
            table,
            publisher,
            publish_fill,
        }
    }

    /// Channelize one packet's header fields and batch-publish them.
    /// Returns the number of values produced.
    pub fn channelize(&self, packet: &PacketArrived) -> usize {
        if packet.is_fill && !self.publish_fill {
            return 0;
        }
        let Some(header) = CcsdsPacketHeader::decode(&packet.data) else {
            warn!(unit = packet.unit_id, "short packet; header not channelized");
            return 0;
        };

        let mut values = Vec::new();
        {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            for (field, def) in table.packet_fields() {
                let Some(dn) = header.field(field) else {
                    debug!(%field, "packet header has no such field");
                    continue;
                };
                let mut val = ChannelValue::new(Arc::clone(def), dn)
                    .with_category(ChannelCategory::PacketHeader);
                val.unit_id = Some(packet.unit_id);
                values.push(val);
            }
        }
        let produced = values.len();
        if produced == 0 {
            return 0;
        }

        let ctx = PublishContext::builder()
            .stream_id(self.publisher.gen_stream_id("PktHdr"))
            .rct(Some(wall_clock_now()))
            .ert(packet.ert)
            .scet(packet.scet)
            .sclk(packet.sclk)
            .realtime(packet.realtime)
            .station(packet.station)
            .vcid(packet.vcid)
            .build();
        self.publisher.publish_flight_and_derived_channels(values, &ctx);
        produced
    }
}

/// Channelizes transfer frame headers.
pub struct FrameHeaderChannelizer {
    table: Arc<Mutex<HeaderChannelTable>>,
    publisher: Arc<ChannelPublisher>,
    publish_idle: bool,
}

impl FrameHeaderChannelizer {
    #[must_use]
    pub fn new(
        table: Arc<Mutex<HeaderChannelTable>>,
        publisher: Arc<ChannelPublisher>,
        publish_idle: bool,
    ) -> Self {
        FrameHeaderChannelizer {
            table,
            publisher,
            publish_idle,
        }
    }

    /// Channelize one frame's header fields and batch-publish them.
    pub fn channelize(&self, frame: &FrameArrived) -> usize {
        if frame.is_idle && !self.publish_idle {
            return 0;
        }
        let Some(header) = TmFrameHeader::decode(&frame.data) else {
            warn!(unit = frame.unit_id, "short frame; header not channelized");
            return 0;
        };
        if header.vcid == TmFrameHeader::FILL && !self.publish_idle {
            return 0;
        }

        let mut values = Vec::new();
        {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            for (field, def) in table.frame_fields() {
                let Some(dn) = header.field(field) else {
                    debug!(%field, "frame header has no such field");
                    continue;
                };
                let mut val = ChannelValue::new(Arc::clone(def), dn)
                    .with_category(ChannelCategory::FrameHeader);
                val.unit_id = Some(frame.unit_id);
                values.push(val);
            }
        }
        let produced = values.len();
        if produced == 0 {
            return 0;
        }

        let ctx = PublishContext::builder()
            .stream_id(self.publisher.gen_stream_id("FrmHdr"))
            .rct(Some(wall_clock_now()))
            .ert(frame.ert)
            .realtime(frame.realtime)
            .station(frame.station)
            .vcid(frame.vcid.or(Some(header.vcid)))
            .build();
        self.publisher.publish_flight_and_derived_channels(values, &ctx);
        produced
    }
}
