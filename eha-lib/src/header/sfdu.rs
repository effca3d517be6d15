//! SFDU/CHDO envelope header channelization.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace, warn};

use super::HeaderChannelTable;
use crate::dict::{ChannelType, HeaderFieldKind};
use crate::publish::{ChannelPublisher, PublishContext};
use crate::sfdu::ChdoSfdu;
use crate::time::{ccsds_epoch, wall_clock_now, Sclk};
use crate::value::{ChannelCategory, ChannelValue, Dn, StationId, UnitId};
use crate::Vcid;

/// Largest VCID an SFDU envelope may legitimately carry.
const MAX_SFDU_VCID: u64 = 0x3f;

/// Clamp an envelope VCID to the restricted range. `None` means the value
/// failed the check and the caller should force zero.
#[must_use]
pub fn restrict_sfdu_vcid(vcid: u64) -> Option<Vcid> {
    if vcid <= MAX_SFDU_VCID {
        Some(vcid as Vcid)
    } else {
        None
    }
}

/// Spacecraft/station/VCID admission filter for incoming envelopes. A
/// `None` field matches anything, as does an envelope that does not carry
/// the compared field.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilter {
    pub scid: Option<u64>,
    pub station: Option<StationId>,
    pub vcid: Option<Vcid>,
}

impl EnvelopeFilter {
    #[must_use]
    pub fn accept(&self, sfdu: &ChdoSfdu) -> bool {
        if let (Some(want), Ok(Some(have))) = (self.scid, sfdu.field_as_unsigned("scft_id")) {
            if want != have {
                return false;
            }
        }
        if let (Some(want), Ok(Some(have))) =
            (self.station, sfdu.field_as_unsigned("data_source"))
        {
            if u64::from(want.0) != have {
                return false;
            }
        }
        if let (Some(want), Ok(Some(have))) = (self.vcid, sfdu.field_as_unsigned("vcid")) {
            if u64::from(want) != have {
                return false;
            }
        }
        true
    }
}

/// Channelizes header fields carried in SFDU/CHDO envelopes.
///
/// On the first envelope seen for an input kind, the packet/frame-header
/// source of every overlapping channel is disabled so each logical field
/// is channelized exactly once, from the SFDU.
pub struct SfduHeaderChannelizer {
    table: Arc<Mutex<HeaderChannelTable>>,
    publisher: Arc<ChannelPublisher>,
    filter: EnvelopeFilter,
    is_sse: bool,
    packet_overlaps_disabled: AtomicBool,
    frame_overlaps_disabled: AtomicBool,
}

impl SfduHeaderChannelizer {
    #[must_use]
    pub fn new(
        table: Arc<Mutex<HeaderChannelTable>>,
        publisher: Arc<ChannelPublisher>,
        filter: EnvelopeFilter,
        is_sse: bool,
    ) -> Self {
        SfduHeaderChannelizer {
            table,
            publisher,
            filter,
            is_sse,
            packet_overlaps_disabled: AtomicBool::new(false),
            frame_overlaps_disabled: AtomicBool::new(false),
        }
    }

    /// Channelize the envelope fields of one packet or frame. Returns the
    /// number of values produced.
    pub fn channelize(
        &self,
        sfdu: &ChdoSfdu,
        kind: HeaderFieldKind,
        vcid: Option<Vcid>,
        unit_id: UnitId,
    ) -> usize {
        if self.is_sse && kind == HeaderFieldKind::Frame {
            error!("SFDU marked as frame under SSE; skipped");
            return 0;
        }

        self.disable_overlaps_once(kind);

        // SSE traffic bypasses the admission filter
        if !self.is_sse && !self.filter.accept(sfdu) {
            trace!(label = sfdu.label(), "envelope failed scid/station/vcid filter");
            return 0;
        }

        let category = if kind == HeaderFieldKind::Frame {
            ChannelCategory::FrameHeader
        } else if self.is_sse {
            ChannelCategory::SsePacketHeader
        } else {
            ChannelCategory::PacketHeader
        };

        let mut values = Vec::new();
        {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            for (field, def) in table.sfdu_fields() {
                let dn = match def.channel_type {
                    ChannelType::SignedInt | ChannelType::Status => {
                        match sfdu.field_as_signed(field) {
                            Ok(Some(v)) => Dn::Signed(v),
                            Ok(None) => continue,
                            Err(err) => {
                                // A bad field does not invalidate the rest
                                // of the envelope.
                                error!(%field, %err, "SFDU header field extraction failed");
                                continue;
                            }
                        }
                    }
                    ChannelType::UnsignedInt | ChannelType::Digital | ChannelType::Time => {
                        match sfdu.field_as_unsigned(field) {
                            Ok(Some(v)) => Dn::Unsigned(v),
                            Ok(None) => continue,
                            Err(err) => {
                                error!(%field, %err, "SFDU header field extraction failed");
                                continue;
                            }
                        }
                    }
                    ChannelType::Float => match sfdu.field_as_float(field) {
                        Ok(Some(v)) => Dn::Float(v),
                        Ok(None) => continue,
                        Err(err) => {
                            error!(%field, %err, "SFDU header field extraction failed");
                            continue;
                        }
                    },
                    ChannelType::Ascii => match sfdu.field_as_ascii(field) {
                        Ok(Some(v)) => Dn::Text(v),
                        Ok(None) => continue,
                        Err(err) => {
                            error!(%field, %err, "SFDU header field extraction failed");
                            continue;
                        }
                    },
                    ChannelType::Boolean => {
                        warn!(%field, "unexpected boolean type for SFDU header channel");
                        continue;
                    }
                };
                let mut val = ChannelValue::new(Arc::clone(def), dn).with_category(category);
                val.unit_id = Some(unit_id);
                values.push(val);
            }
        }
        let produced = values.len();
        if produced == 0 {
            return 0;
        }

        // Pull as much time data from the envelope as possible, falling
        // back field by field.
        let ert = match sfdu.field_as_epoch("ert") {
            Ok(Some(e)) => e,
            _ => match sfdu.field_as_epoch("mst") {
                Ok(Some(e)) => {
                    debug!("no ERT in envelope; using MST");
                    e
                }
                _ => {
                    debug!("no ERT or MST in envelope; using current time");
                    wall_clock_now()
                }
            },
        };
        let sclk = sfdu.field_as_sclk("sclk").ok().flatten().unwrap_or(Sclk::ZERO);
        let scet = match sfdu.field_as_epoch("scet") {
            Ok(Some(e)) => e,
            // Frame headers make up SCET from ERT when available
            _ if kind == HeaderFieldKind::Frame => ert,
            _ => ccsds_epoch(),
        };

        let station = sfdu
            .field_as_unsigned("data_source")
            .ok()
            .flatten()
            .map_or(StationId::UNSPECIFIED, |v| StationId(v as u16));

        let restricted_vcid = match vcid {
            Some(v) => match restrict_sfdu_vcid(u64::from(v)) {
                Some(ok) => ok,
                None => {
                    warn!(vcid = v, "VCID failed restricted range check; forced to 0");
                    0
                }
            },
            None => 0,
        };

        let ctx = PublishContext::builder()
            .stream_id(self.publisher.gen_stream_id(&format!("{ert}")))
            .rct(Some(wall_clock_now()))
            .ert(Some(ert))
            .scet(Some(scet))
            .sclk(Some(sclk))
            .realtime(true)
            .station(station)
            .vcid(Some(restricted_vcid))
            .build();
        self.publisher.publish_flight_and_derived_channels(values, &ctx);
        produced
    }

    fn disable_overlaps_once(&self, kind: HeaderFieldKind) {
        let flag = match kind {
            HeaderFieldKind::Frame => &self.frame_overlaps_disabled,
            _ => &self.packet_overlaps_disabled,
        };
        if !flag.swap(true, Ordering::SeqCst) {
            self.table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .disable_overlapping(if kind == HeaderFieldKind::Frame {
                    HeaderFieldKind::Frame
                } else {
                    HeaderFieldKind::Packet
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::{header_def, publisher_fixture};
    use crate::header::{CcsdsPacketHeader, PacketHeaderChannelizer};
    use crate::dict::{ChannelDefinitionProvider, InMemoryDictionary};
    use crate::input::PacketArrived;
    use crate::msg::EhaMessage;
    use crate::sfdu::tests::{build_sfdu, test_field_table};
    use crate::value::ChannelValue;

    fn channelized(bus: &crate::msg::CollectingBus) -> Vec<ChannelValue> {
        bus.take()
            .into_iter()
            .filter_map(|m| match m {
                EhaMessage::ChannelValue(v) => Some(v.value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn envelope_fields_channelized_with_station() {
        let mut d = InMemoryDictionary::new();
        d.add_channel(header_def("H-0010", HeaderFieldKind::Sfdu, "scft_id"));
        d.add_channel(header_def("H-0011", HeaderFieldKind::Sfdu, "data_source"));
        let dict = Arc::new(d);
        let mut table = HeaderChannelTable::new();
        table.add_definitions(dict.definitions());
        let (publisher, bus) = publisher_fixture(dict);

        let channelizer = SfduHeaderChannelizer::new(
            Arc::new(Mutex::new(table)),
            publisher,
            EnvelopeFilter::default(),
            false,
        );
        let sfdu =
            ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 0, &[])).unwrap();
        assert_eq!(
            channelizer.channelize(&sfdu, HeaderFieldKind::Packet, Some(2), 5),
            2
        );
        let values = channelized(&bus);
        assert_eq!(values.len(), 2);
        for v in &values {
            assert_eq!(v.category, ChannelCategory::PacketHeader);
            assert_eq!(v.station, StationId(14));
            assert_eq!(v.vcid, Some(2));
            assert!(v.ert.is_some());
        }
    }

    #[test]
    fn station_filter_rejects_mismatched_envelope() {
        let mut d = InMemoryDictionary::new();
        d.add_channel(header_def("H-0010", HeaderFieldKind::Sfdu, "scft_id"));
        let dict = Arc::new(d);
        let mut table = HeaderChannelTable::new();
        table.add_definitions(dict.definitions());
        let (publisher, bus) = publisher_fixture(dict);

        let channelizer = SfduHeaderChannelizer::new(
            Arc::new(Mutex::new(table)),
            publisher,
            EnvelopeFilter {
                station: Some(StationId(43)),
                ..EnvelopeFilter::default()
            },
            false,
        );
        let sfdu =
            ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 0, &[])).unwrap();
        assert_eq!(
            channelizer.channelize(&sfdu, HeaderFieldKind::Packet, None, 5),
            0
        );
        assert!(channelized(&bus).is_empty());
    }

    #[test]
    fn out_of_range_vcid_forced_to_zero() {
        let mut d = InMemoryDictionary::new();
        d.add_channel(header_def("H-0010", HeaderFieldKind::Sfdu, "scft_id"));
        let dict = Arc::new(d);
        let mut table = HeaderChannelTable::new();
        table.add_definitions(dict.definitions());
        let (publisher, bus) = publisher_fixture(dict);

        let channelizer = SfduHeaderChannelizer::new(
            Arc::new(Mutex::new(table)),
            publisher,
            EnvelopeFilter::default(),
            false,
        );
        let sfdu =
            ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 0, &[])).unwrap();
        channelizer.channelize(&sfdu, HeaderFieldKind::Packet, Some(900), 5);
        let values = channelized(&bus);
        assert_eq!(values[0].vcid, Some(0));
    }

    #[test]
    fn overlapping_field_channelized_once_from_sfdu() {
        let mut d = InMemoryDictionary::new();
        // scft_id reachable from both the packet header ("apid" stand-in)
        // and the SFDU; the SFDU wins once envelopes are seen.
        d.add_channel(
            header_def("H-0010", HeaderFieldKind::Packet, "apid")
                .with_header_field(HeaderFieldKind::Sfdu, "scft_id"),
        );
        let dict = Arc::new(d);
        let mut table = HeaderChannelTable::new();
        table.add_definitions(dict.definitions());
        let table = Arc::new(Mutex::new(table));
        let (publisher, bus) = publisher_fixture(dict);

        let sfdu_chan = SfduHeaderChannelizer::new(
            table.clone(),
            publisher.clone(),
            EnvelopeFilter::default(),
            false,
        );
        let pkt_chan = PacketHeaderChannelizer::new(table, publisher, false);

        let sfdu =
            ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 0, &[])).unwrap();
        let packet = PacketArrived {
            data: vec![0xd, 0x59, 0xd2, 0xab, 0x0, 0x1, 0xff, 0xff],
            ert: None,
            scet: None,
            sclk: None,
            station: StationId(14),
            vcid: None,
            unit_id: 9,
            realtime: true,
            is_fill: false,
            sfdu: Some(sfdu.clone()),
        };
        assert!(CcsdsPacketHeader::decode(&packet.data).is_some());

        // SFDU seen first: one value from the envelope, none from the
        // packet header source.
        let from_sfdu = sfdu_chan.channelize(&sfdu, HeaderFieldKind::Packet, None, 9);
        let from_packet = pkt_chan.channelize(&packet);
        assert_eq!(from_sfdu, 1);
        assert_eq!(from_packet, 0);
        assert_eq!(channelized(&bus).len(), 1);
    }
}
