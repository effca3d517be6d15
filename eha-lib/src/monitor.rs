//! DSN station monitor channelization.
//!
//! Decodes the repeated channelized data area records of a MON SFDU. Each
//! record is a fixed 4-byte prefix — 5-bit source code, 1-bit short/long
//! flag, 4-bit filler length, 12-bit channel number — followed, in long
//! form, by an 8-bit word count and `2 * word_count` bytes of value; in
//! short form the value is the single inline byte of the prefix.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bits;
use crate::dict::{ChannelDefinition, ChannelDefinitionProvider, ChannelType};
use crate::publish::{ChannelPublisher, PublishContext};
use crate::sfdu::{ChdoSfdu, CHANNELIZED_DATA_AREA_CHDO};
use crate::time::{ccsds_epoch, wall_clock_now, Sclk};
use crate::value::{ChannelValue, Dn, StationId, UnitId};
use crate::{Error, Result};

const RECORD_PREFIX_LEN: usize = 4;

/// Channelizes DSN monitor SFDUs.
pub struct DsnMonitorDecom {
    publisher: Arc<ChannelPublisher>,
    /// Session station filter; envelopes from other stations are discarded.
    filter_station: Option<StationId>,
    /// Monitor definitions by wire channel number.
    chan_indices: HashMap<u32, Arc<ChannelDefinition>>,
}

impl DsnMonitorDecom {
    #[must_use]
    pub fn new(
        dict: &Arc<dyn ChannelDefinitionProvider>,
        publisher: Arc<ChannelPublisher>,
        filter_station: Option<StationId>,
    ) -> Self {
        let mut chan_indices = HashMap::new();
        for def in dict.definitions() {
            if let Some(index) = def.index {
                if def.definition_type.is_monitor() {
                    chan_indices.insert(index, def);
                }
            }
        }
        DsnMonitorDecom {
            publisher,
            filter_station,
            chan_indices,
        }
    }

    /// Process the monitor channels of one SFDU, publishing the extracted
    /// batch. Returns the number of records examined, including records
    /// that could not be matched to a definition.
    pub fn process(&self, sfdu: &ChdoSfdu, unit_id: UnitId) -> u64 {
        let Ok(Some(_scid)) = sfdu.field_as_unsigned("scft_id") else {
            error!(
                label = sfdu.label(),
                "cannot obtain scft_id; abandoning DSN monitors from SFDU"
            );
            return 0;
        };

        // Antenna/facility id under either of its two field names
        let station = ["data_source", "source_code"]
            .iter()
            .find_map(|name| sfdu.field_as_unsigned(name).ok().flatten());
        let Some(station) = station else {
            error!(
                label = sfdu.label(),
                "cannot obtain antenna/facility ID; abandoning DSN monitors from SFDU"
            );
            return 0;
        };
        let station = StationId(station as u16);

        if let Some(want) = self.filter_station {
            if want != station {
                info!(
                    station = %station,
                    session_station = %want,
                    "MON SFDU for another station; discarded"
                );
                return 0;
            }
        }

        let number_of_channels = match sfdu.field_as_unsigned("number_channels") {
            Ok(Some(n)) => Some(n),
            _ => {
                warn!(label = sfdu.label(), "cannot obtain number_channels");
                None
            }
        };

        let Some(chdo) = sfdu.data_chdo() else {
            error!(
                label = sfdu.label(),
                "SFDU has no data CHDO; cannot process DSN monitor"
            );
            return 0;
        };
        if chdo.chdo_type != CHANNELIZED_DATA_AREA_CHDO {
            info!(
                chdo_type = chdo.chdo_type,
                "data is not a channelized data area CHDO; cannot process DSN monitor"
            );
            return 0;
        }

        let Ok(Some(monitor_sample_time)) = sfdu.field_as_epoch("mst") else {
            error!(
                label = sfdu.label(),
                "cannot obtain monitor sample time; cannot process DSN monitor"
            );
            return 0;
        };

        let body = chdo.bytes_without_header();
        let mut values: Vec<ChannelValue> = Vec::with_capacity(64);
        let mut offset = 0usize;
        let mut examined = 0u64;

        while offset < body.len() {
            match self.decode_record(body, offset, examined) {
                Ok(record) => {
                    if let Some(value) = record.value {
                        values.push(value);
                    }
                    offset += RECORD_PREFIX_LEN + record.long_value_len;
                }
                Err(RecordError::Skip(err)) => {
                    debug!(record = examined, %err, "monitor record skipped");
                    offset += RECORD_PREFIX_LEN;
                }
                Err(RecordError::AbortEnvelope(err)) => {
                    error!(
                        record = examined,
                        label = sfdu.label(),
                        %err,
                        "unrecoverable monitor record; aborting remaining records of this SFDU"
                    );
                    return examined;
                }
            }
            examined += 1;
        }

        match number_of_channels {
            Some(declared) if declared != examined => warn!(
                declared,
                counted = examined,
                label = sfdu.label(),
                "monitor channel count mismatch"
            ),
            Some(declared) => {
                debug!(declared, counted = examined, "monitor channel count match");
            }
            None => debug!(counted = examined, "no number_channels to compare to"),
        }

        if !values.is_empty() {
            for val in &mut values {
                val.unit_id = Some(unit_id);
            }
            let ctx = PublishContext::builder()
                .stream_id(self.publisher.gen_stream_id("Mon"))
                .rct(Some(wall_clock_now()))
                .ert(Some(monitor_sample_time))
                .scet(Some(ccsds_epoch()))
                .sclk(Some(Sclk::ZERO))
                .realtime(true)
                .station(station)
                .use_triggers_override(Some(false))
                .build();
            self.publisher.publish_flight_and_derived_channels(values, &ctx);
        }

        examined
    }

    fn decode_record(
        &self,
        body: &[u8],
        offset: usize,
        index: u64,
    ) -> std::result::Result<DecodedRecord, RecordError> {
        let channel_num =
            bits::extract_u64(body, offset + 2, 4, 12).map_err(skip)? as u32;
        // Record not in the dictionary is normal: legacy stations vary in
        // which monitor channels they deliver.
        let def = self.chan_indices.get(&channel_num);

        let short_value = bits::extract_u64(body, offset, 5, 1).map_err(skip)? == 1;
        let filler = bits::extract_u64(body, offset + 2, 0, 4).map_err(skip)? as usize;

        if short_value {
            if filler > 7 {
                return Err(RecordError::Skip(Error::Envelope(format!(
                    "record {index} has lv_flag=1 but filler_length={filler}"
                ))));
            }
            let value = match def {
                Some(def) => Some(
                    extract_channel_dn(def, body, offset + 1, filler, 8 - filler)
                        .map_err(skip)?,
                ),
                None => None,
            };
            Ok(DecodedRecord {
                value,
                long_value_len: 0,
            })
        } else {
            let words = bits::extract_u64(body, offset + 1, 0, 8).map_err(skip)? as usize;
            if words < 1 {
                return Err(RecordError::Skip(Error::Envelope(format!(
                    "record {index} has lv_flag=0 but length_value < 1"
                ))));
            }
            if words > 255 {
                return Err(RecordError::AbortEnvelope(Error::Envelope(format!(
                    "record {index} declares illegal length_value {words}"
                ))));
            }
            let long_value_len = words * 2;
            let value = match def {
                Some(def) => match extract_channel_dn(
                    def,
                    body,
                    offset + RECORD_PREFIX_LEN + filler / 8,
                    filler % 8,
                    16 * words - filler,
                ) {
                    Ok(v) => Some(v),
                    // The declared length overruns the buffer: nothing
                    // after this record can be framed either.
                    Err(e @ Error::NotEnoughData { .. }) => {
                        return Err(RecordError::AbortEnvelope(e))
                    }
                    // The declared length still frames the record; drop
                    // just this value and keep the cursor discipline.
                    Err(e) => {
                        debug!(record = index, %e, "monitor value not extractable");
                        None
                    }
                },
                None => None,
            };
            Ok(DecodedRecord {
                value,
                long_value_len,
            })
        }
    }
}

struct DecodedRecord {
    value: Option<ChannelValue>,
    long_value_len: usize,
}

enum RecordError {
    /// Skip this record, advance by the fixed prefix, keep going.
    Skip(Error),
    /// The rest of the envelope cannot be framed.
    AbortEnvelope(Error),
}

fn skip(err: Error) -> RecordError {
    RecordError::Skip(err)
}

fn extract_channel_dn(
    def: &Arc<ChannelDefinition>,
    body: &[u8],
    byte_offset: usize,
    bit_offset: usize,
    width: usize,
) -> Result<ChannelValue> {
    let dn = match def.channel_type {
        ChannelType::SignedInt => {
            Dn::Signed(bits::extract_i64(body, byte_offset, bit_offset, width)?)
        }
        ChannelType::UnsignedInt
        | ChannelType::Status
        | ChannelType::Digital
        | ChannelType::Time => Dn::Unsigned(bits::extract_u64(body, byte_offset, bit_offset, width)?),
        ChannelType::Boolean => {
            Dn::Boolean(bits::extract_u64(body, byte_offset, bit_offset, width)? != 0)
        }
        ChannelType::Float => Dn::Float(bits::extract_f64(body, byte_offset, bit_offset, width)?),
        ChannelType::Ascii => {
            if bit_offset != 0 {
                return Err(Error::Envelope(format!(
                    "ASCII monitor channel {} is not byte aligned",
                    def.id
                )));
            }
            Dn::Text(bits::extract_ascii(body, byte_offset, width / 8)?)
        }
    };
    Ok(ChannelValue::new(Arc::clone(def), dn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{ChannelDefinitionType, InMemoryDictionary};
    use crate::lad::ChannelLad;
    use crate::msg::{CollectingBus, EhaMessage, MessageBus};
    use crate::sfdu::tests::{build_sfdu, test_field_table};
    use crate::time::ChannelTimeComparator;

    fn monitor_def(id: &str, index: u32, chan_type: ChannelType) -> ChannelDefinition {
        ChannelDefinition::new(id, chan_type)
            .with_definition_type(ChannelDefinitionType::Monitor)
            .with_index(index)
    }

    struct Fixture {
        decom: DsnMonitorDecom,
        bus: Arc<CollectingBus>,
        lad: Arc<ChannelLad>,
    }

    fn fixture(filter: Option<StationId>) -> Fixture {
        let mut d = InMemoryDictionary::new();
        d.add_channel(monitor_def("M-0005", 5, ChannelType::UnsignedInt));
        d.add_channel(monitor_def("M-0006", 6, ChannelType::SignedInt));
        d.add_channel(monitor_def("M-0007", 7, ChannelType::Float));
        let dict: Arc<dyn ChannelDefinitionProvider> = Arc::new(d);

        let bus = Arc::new(CollectingBus::new());
        let lad = Arc::new(ChannelLad::new(
            dict.clone(),
            ChannelTimeComparator::default(),
        ));
        let publisher = Arc::new(
            ChannelPublisher::builder()
                .bus(bus.clone() as Arc<dyn MessageBus>)
                .lad(lad.clone())
                .build(),
        );
        Fixture {
            decom: DsnMonitorDecom::new(&dict, publisher, filter),
            bus,
            lad,
        }
    }

    fn values(bus: &CollectingBus) -> Vec<ChannelValue> {
        bus.take()
            .into_iter()
            .filter_map(|m| match m {
                EhaMessage::ChannelValue(v) => Some(v.value),
                _ => None,
            })
            .collect()
    }

    /// Short-form record: source=0, lv_flag=1, inline value, filler +
    /// channel number in the trailing two bytes.
    fn short_record(channel: u16, value: u8) -> [u8; 4] {
        [0x04, value, (channel >> 8) as u8 & 0x0f, channel as u8]
    }

    #[test]
    fn short_form_record_yields_inline_value() {
        let f = fixture(None);
        let body = short_record(0x005, 0x2a);
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 1, &body)).unwrap();

        assert_eq!(f.decom.process(&sfdu, 3), 1);
        let vals = values(&f.bus);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].id(), "M-0005");
        assert_eq!(vals[0].dn, Dn::Unsigned(0x2a));
        assert_eq!(vals[0].station, StationId(14));
        assert_eq!(vals[0].unit_id, Some(3));

        // Monitor LAD slots are station-scoped
        assert!(f
            .lad
            .get_most_recent_value("M-0005", true, StationId(14))
            .is_some());
        assert!(f
            .lad
            .get_most_recent_value("M-0005", true, StationId(15))
            .is_none());
    }

    #[test]
    fn long_form_record_with_filler() {
        let f = fixture(None);
        // lv_flag=0, word count 1, filler 4: value is the low 12 bits of
        // the 16-bit long value area.
        let body = [0x00, 0x01, 0x40, 0x05, 0x0f, 0xff];
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 1, &body)).unwrap();

        assert_eq!(f.decom.process(&sfdu, 1), 1);
        let vals = values(&f.bus);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].id(), "M-0005");
        assert_eq!(vals[0].dn, Dn::Unsigned(0xfff));
    }

    #[test]
    fn unknown_channel_number_advances_and_continues() {
        let f = fixture(None);
        let mut body = Vec::new();
        body.extend_from_slice(&short_record(0xf0f, 0x11)); // not in dictionary
        body.extend_from_slice(&short_record(0x005, 0x22));
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 2, &body)).unwrap();

        assert_eq!(f.decom.process(&sfdu, 1), 2, "both records examined");
        let vals = values(&f.bus);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].dn, Dn::Unsigned(0x22));
    }

    #[test]
    fn zero_word_count_skips_record_and_advances_four() {
        let f = fixture(None);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x00, 0x00, 0x05]); // lv_flag=0, words=0
        body.extend_from_slice(&short_record(0x006, 0x7f));
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 2, &body)).unwrap();

        assert_eq!(f.decom.process(&sfdu, 1), 2);
        let vals = values(&f.bus);
        assert_eq!(vals.len(), 1, "bad record skipped, next one decoded");
        assert_eq!(vals[0].id(), "M-0006");
    }

    #[test]
    fn short_record_with_bad_filler_is_skipped() {
        let f = fixture(None);
        let mut body = Vec::new();
        // lv_flag=1 with filler 8 is inconsistent
        body.extend_from_slice(&[0x04, 0x2a, 0x80, 0x05]);
        body.extend_from_slice(&short_record(0x005, 0x33));
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 2, &body)).unwrap();

        assert_eq!(f.decom.process(&sfdu, 1), 2);
        let vals = values(&f.bus);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].dn, Dn::Unsigned(0x33));
    }

    #[test]
    fn overrunning_long_value_aborts_envelope() {
        let f = fixture(None);
        // words=2 declares 4 value bytes but only 2 remain
        let body = [0x00, 0x02, 0x00, 0x05, 0xaa, 0xbb];
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 1, &body)).unwrap();
        assert_eq!(f.decom.process(&sfdu, 1), 0, "aborted on the first record");
        assert!(values(&f.bus).is_empty());
    }

    #[test]
    fn station_filter_discards_foreign_envelopes() {
        let f = fixture(Some(StationId(43)));
        let body = short_record(0x005, 0x2a);
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 1, &body)).unwrap();
        assert_eq!(f.decom.process(&sfdu, 1), 0);
        assert!(values(&f.bus).is_empty());
    }

    #[test]
    fn count_mismatch_is_logged_not_fatal() {
        let f = fixture(None);
        let body = short_record(0x005, 0x2a);
        // declared 9 channels, actual 1
        let sfdu = ChdoSfdu::parse(test_field_table(), &build_sfdu(76, 14, 9, &body)).unwrap();
        assert_eq!(f.decom.process(&sfdu, 1), 1);
        assert_eq!(values(&f.bus).len(), 1);
    }
}
