//! Channel latest-value table.
//!
//! Keeps the most recent sample per (channel, station), segregated by
//! real-time vs. recorded lineage. This is the only structure in the
//! pipeline shared across dispatch contexts; one coarse lock serializes
//! every operation, which is cheap at telemetry rates.
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use hifitime::Epoch;

use crate::dict::{ChannelDefinitionProvider, ChannelId};
use crate::time::{wall_clock_now, ChannelTimeComparator};
use crate::value::{ChannelValue, StationId};
use crate::{Error, Result};

/// Key of one LAD slot. The station is [StationId::UNSPECIFIED] for every
/// definition type except monitor, collapsing all non-monitor lookups to a
/// single slot per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LadKey {
    pub channel: ChannelId,
    pub station: StationId,
}

#[derive(Default)]
struct LadMaps {
    realtime: HashMap<LadKey, ChannelValue>,
    recorded: HashMap<LadKey, ChannelValue>,
    last_update: Option<Epoch>,
}

/// The latest-value table.
pub struct ChannelLad {
    dict: Arc<dyn ChannelDefinitionProvider>,
    comparator: ChannelTimeComparator,
    inner: Mutex<LadMaps>,
}

impl ChannelLad {
    #[must_use]
    pub fn new(dict: Arc<dyn ChannelDefinitionProvider>, comparator: ChannelTimeComparator) -> Self {
        ChannelLad {
            dict,
            comparator,
            inner: Mutex::new(LadMaps::default()),
        }
    }

    /// The definition provider this LAD resolves channels against. Exposed
    /// for derivations and EU algorithms that need dictionary access.
    #[must_use]
    pub fn definition_provider(&self) -> &Arc<dyn ChannelDefinitionProvider> {
        &self.dict
    }

    /// Offer a new value. The slot is replaced only when the value is later
    /// than the current occupant under the configured comparison strategy;
    /// ties keep the existing entry.
    ///
    /// # Errors
    /// [Error::InvalidArgument] for an empty channel id, or for a
    /// recorded-lineage value of a monitor or header definition type (those
    /// must be real-time). No mutation occurs on error.
    pub fn add_new_value(&self, value: ChannelValue) -> Result<()> {
        if value.id().is_empty() {
            return Err(Error::InvalidArgument(
                "channel value has no channel id".into(),
            ));
        }
        let def_type = value.definition_type();
        if !value.realtime && (def_type.is_monitor() || def_type.is_header()) {
            return Err(Error::InvalidArgument(format!(
                "recorded value not allowed for {def_type:?} channel {}",
                value.id()
            )));
        }

        let key = LadKey {
            channel: value.id().to_string(),
            station: if def_type.is_monitor() {
                value.station
            } else {
                StationId::UNSPECIFIED
            },
        };

        let mut maps = self.lock();
        let map = if value.realtime {
            &mut maps.realtime
        } else {
            &mut maps.recorded
        };
        let replace = match map.get(&key) {
            Some(current) => self.comparator.is_later(&value, current),
            None => true,
        };
        if replace {
            map.insert(key, value);
            maps.last_update = Some(wall_clock_now());
        }
        Ok(())
    }

    /// Latest value for a channel. For non-monitor channels the station
    /// argument is ignored.
    #[must_use]
    pub fn get_most_recent_value(
        &self,
        channel: &str,
        realtime: bool,
        station: StationId,
    ) -> Option<ChannelValue> {
        let station = match self.dict.definition(channel) {
            Some(def) if def.definition_type.is_monitor() => station,
            _ => StationId::UNSPECIFIED,
        };
        let key = LadKey {
            channel: channel.to_string(),
            station,
        };
        let maps = self.lock();
        let map = if realtime {
            &maps.realtime
        } else {
            &maps.recorded
        };
        map.get(&key).cloned()
    }

    /// All channel ids currently present, sorted and deduplicated across
    /// both lineage maps.
    #[must_use]
    pub fn get_all_channel_ids(&self) -> Vec<ChannelId> {
        let maps = self.lock();
        let mut ids: Vec<ChannelId> = maps
            .realtime
            .keys()
            .chain(maps.recorded.keys())
            .map(|k| k.channel.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// All (channel, station) pairs currently present, sorted.
    #[must_use]
    pub fn get_all_channel_id_and_station_pairs(&self) -> Vec<(ChannelId, StationId)> {
        let maps = self.lock();
        let mut pairs: Vec<(ChannelId, StationId)> = maps
            .realtime
            .keys()
            .chain(maps.recorded.keys())
            .map(|k| (k.channel.clone(), k.station))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Empty both maps, returning the previous last-update time so callers
    /// can detect staleness.
    pub fn clear_all(&self) -> Option<Epoch> {
        let mut maps = self.lock();
        maps.realtime.clear();
        maps.recorded.clear();
        maps.last_update.take()
    }

    /// Serialize every current value as CSV with a fixed 12-column header,
    /// sorted by channel id, then station, real-time rows first. The output
    /// is byte-deterministic for a given table state.
    pub fn write_csv<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(
            out,
            "channelId,dn,eu,rct,ert,scet,sclk,station,vcid,dnAlarm,euAlarm,realtime"
        )?;

        let rows: Vec<ChannelValue> = {
            let maps = self.lock();
            let mut rows: Vec<ChannelValue> = maps
                .realtime
                .values()
                .chain(maps.recorded.values())
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                a.id()
                    .cmp(b.id())
                    .then(a.station.cmp(&b.station))
                    .then(b.realtime.cmp(&a.realtime))
            });
            rows
        };

        for val in rows {
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{},{}",
                val.id(),
                val.dn,
                val.eu.map(|e| e.to_string()).unwrap_or_default(),
                val.rct.map(|e| e.to_string()).unwrap_or_default(),
                val.ert.map(|e| e.to_string()).unwrap_or_default(),
                val.scet.map(|e| e.to_string()).unwrap_or_default(),
                val.sclk.map(|s| s.to_string()).unwrap_or_default(),
                val.station,
                val.vcid.map(|v| v.to_string()).unwrap_or_default(),
                val.dn_alarm,
                val.eu_alarm,
                val.realtime,
            )?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LadMaps> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{
        ChannelDefinition, ChannelDefinitionType, ChannelType, InMemoryDictionary,
    };
    use crate::time::TimeComparisonStrategy;
    use crate::value::Dn;
    use hifitime::Epoch;

    fn dict() -> Arc<InMemoryDictionary> {
        let mut d = InMemoryDictionary::new();
        d.add_channel(ChannelDefinition::new("A-0001", ChannelType::UnsignedInt));
        d.add_channel(
            ChannelDefinition::new("M-0005", ChannelType::UnsignedInt)
                .with_definition_type(ChannelDefinitionType::Monitor)
                .with_index(5),
        );
        d.add_channel(
            ChannelDefinition::new("H-0001", ChannelType::UnsignedInt)
                .with_definition_type(ChannelDefinitionType::Header),
        );
        Arc::new(d)
    }

    fn lad() -> (ChannelLad, Arc<InMemoryDictionary>) {
        let d = dict();
        (
            ChannelLad::new(
                d.clone(),
                ChannelTimeComparator::new(TimeComparisonStrategy::Scet),
            ),
            d,
        )
    }

    fn value(d: &InMemoryDictionary, id: &str, dn: u64, scet_sec: i64) -> ChannelValue {
        let mut v = ChannelValue::new(d.definition(id).unwrap(), Dn::Unsigned(dn));
        v.scet = Some(Epoch::from_gregorian_utc(2026, 3, 1, 0, 0, 0, 0)
            + hifitime::Duration::from_seconds(scet_sec as f64));
        v
    }

    #[test]
    fn latest_wins() {
        let (lad, d) = lad();
        lad.add_new_value(value(&d, "A-0001", 1, 10)).unwrap();
        lad.add_new_value(value(&d, "A-0001", 2, 20)).unwrap();
        // Older sample must not displace the newer one
        lad.add_new_value(value(&d, "A-0001", 3, 5)).unwrap();

        let got = lad
            .get_most_recent_value("A-0001", true, StationId::UNSPECIFIED)
            .unwrap();
        assert_eq!(got.dn, Dn::Unsigned(2));
    }

    #[test]
    fn ties_keep_existing() {
        let (lad, d) = lad();
        lad.add_new_value(value(&d, "A-0001", 1, 10)).unwrap();
        lad.add_new_value(value(&d, "A-0001", 2, 10)).unwrap();
        let got = lad
            .get_most_recent_value("A-0001", true, StationId::UNSPECIFIED)
            .unwrap();
        assert_eq!(got.dn, Dn::Unsigned(1));
    }

    #[test]
    fn station_segregation_for_monitor_only() {
        let (lad, d) = lad();

        let mut v = value(&d, "M-0005", 10, 1);
        v.station = StationId(14);
        lad.add_new_value(v).unwrap();
        let mut v = value(&d, "M-0005", 20, 1);
        v.station = StationId(43);
        lad.add_new_value(v).unwrap();

        assert_eq!(
            lad.get_most_recent_value("M-0005", true, StationId(14))
                .unwrap()
                .dn,
            Dn::Unsigned(10)
        );
        assert_eq!(
            lad.get_most_recent_value("M-0005", true, StationId(43))
                .unwrap()
                .dn,
            Dn::Unsigned(20)
        );
        assert!(lad
            .get_most_recent_value("M-0005", true, StationId(99))
            .is_none());

        // Non-monitor lookups ignore the station argument entirely
        let mut v = value(&d, "A-0001", 5, 1);
        v.station = StationId(14);
        lad.add_new_value(v).unwrap();
        assert!(lad
            .get_most_recent_value("A-0001", true, StationId(61))
            .is_some());
    }

    #[test]
    fn realtime_and_recorded_are_independent() {
        let (lad, d) = lad();
        lad.add_new_value(value(&d, "A-0001", 1, 10)).unwrap();
        let mut rec = value(&d, "A-0001", 2, 99);
        rec.realtime = false;
        lad.add_new_value(rec).unwrap();

        assert_eq!(
            lad.get_most_recent_value("A-0001", true, StationId::UNSPECIFIED)
                .unwrap()
                .dn,
            Dn::Unsigned(1)
        );
        assert_eq!(
            lad.get_most_recent_value("A-0001", false, StationId::UNSPECIFIED)
                .unwrap()
                .dn,
            Dn::Unsigned(2)
        );
    }

    #[test]
    fn rejects_recorded_monitor_and_header() {
        let (lad, d) = lad();
        let mut v = value(&d, "M-0005", 1, 1);
        v.realtime = false;
        assert!(matches!(
            lad.add_new_value(v),
            Err(Error::InvalidArgument(_))
        ));

        let mut v = value(&d, "H-0001", 1, 1);
        v.realtime = false;
        assert!(matches!(
            lad.add_new_value(v),
            Err(Error::InvalidArgument(_))
        ));
        assert!(lad.get_all_channel_ids().is_empty(), "no partial mutation");
    }

    #[test]
    fn clear_all_returns_last_update() {
        let (lad, d) = lad();
        assert!(lad.clear_all().is_none());
        lad.add_new_value(value(&d, "A-0001", 1, 1)).unwrap();
        assert!(lad.clear_all().is_some());
        assert!(lad.get_all_channel_ids().is_empty());
        assert!(lad.clear_all().is_none(), "cleared table has no update time");
    }

    #[test]
    fn csv_is_sorted_with_fixed_header() {
        let (lad, d) = lad();
        lad.add_new_value(value(&d, "A-0001", 7, 1)).unwrap();
        let mut v = value(&d, "M-0005", 9, 1);
        v.station = StationId(14);
        lad.add_new_value(v).unwrap();

        let mut buf = Vec::new();
        lad.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "channelId,dn,eu,rct,ert,scet,sclk,station,vcid,dnAlarm,euAlarm,realtime"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("A-0001,7,"));
        assert!(lines[2].starts_with("M-0005,9,"));
        assert!(lines[2].contains(",14,"));
    }

    #[test]
    fn csv_header_only_when_empty() {
        let (lad, _) = lad();
        let mut buf = Vec::new();
        lad.write_csv(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().lines().count(), 1);
    }
}
