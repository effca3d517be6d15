//! Decom listener that turns field events into channel values and,
//! optionally, event records.
use std::collections::BTreeMap;
use std::sync::Arc;

use hifitime::Epoch;
use tracing::debug;

use super::{DecomListener, DecomOutput};
use crate::dict::{
    ChannelDefinitionProvider, ChannelField, ChannelId, ChannelRef, DecomMapDefinition,
    EvrDefinitionProvider, EvrField, TimeField,
};
use crate::evr::EvrRecord;
use crate::time::{Sclk, SclkScetConverter};
use crate::value::{ChannelValue, Dn, StationId, UnitId};
use crate::Vcid;

/// Accumulates channel values (and, with EVR collection enabled, event
/// records) from one decommutation run.
///
/// SCLK/SCET context is listener-local: a time statement sets or advances
/// the current SCLK and recomputes SCET through the configured correlation;
/// subsequent fields are stamped with that context. One instance serves one
/// decode at a time and must not be shared across concurrent decodes.
pub struct ChannelizationListener {
    dict: Arc<dyn ChannelDefinitionProvider>,
    evr_dict: Option<Arc<dyn EvrDefinitionProvider>>,
    sclk_converter: Arc<dyn SclkScetConverter>,

    current_sclk: Option<Sclk>,
    current_scet: Option<Epoch>,
    station: StationId,
    vcid: Option<Vcid>,
    realtime: bool,
    unit_id: Option<UnitId>,

    /// Scoped name-to-id rebindings, innermost last. One frame per entered
    /// map, pushed on map start and popped on map end.
    bindings: Vec<BTreeMap<String, ChannelId>>,

    values: Vec<ChannelValue>,
    evrs: Vec<EvrRecord>,
}

impl ChannelizationListener {
    #[must_use]
    pub fn new(
        dict: Arc<dyn ChannelDefinitionProvider>,
        sclk_converter: Arc<dyn SclkScetConverter>,
    ) -> Self {
        ChannelizationListener {
            dict,
            evr_dict: None,
            sclk_converter,
            current_sclk: None,
            current_scet: None,
            station: StationId::UNSPECIFIED,
            vcid: None,
            realtime: true,
            unit_id: None,
            bindings: Vec::new(),
            values: Vec::new(),
            evrs: Vec::new(),
        }
    }

    /// Enable the hybrid channel+EVR mode.
    #[must_use]
    pub fn with_evr_collection(mut self, evr_dict: Arc<dyn EvrDefinitionProvider>) -> Self {
        self.evr_dict = Some(evr_dict);
        self
    }

    /// Establish the per-unit stamping context before a decode. Also resets
    /// the SCLK/SCET context.
    pub fn begin_unit(
        &mut self,
        station: StationId,
        vcid: Option<Vcid>,
        realtime: bool,
        unit_id: Option<UnitId>,
        initial_sclk: Option<Sclk>,
    ) {
        self.station = station;
        self.vcid = vcid;
        self.realtime = realtime;
        self.unit_id = unit_id;
        self.current_sclk = initial_sclk;
        self.current_scet = initial_sclk
            .as_ref()
            .and_then(|s| self.sclk_converter.to_scet(s));
        self.bindings.clear();
    }

    /// Hand back and reset the accumulated channel values.
    #[must_use]
    pub fn collect_channel_values(&mut self) -> Vec<ChannelValue> {
        std::mem::take(&mut self.values)
    }

    /// Hand back and reset the accumulated event records.
    #[must_use]
    pub fn collect_evrs(&mut self) -> Vec<EvrRecord> {
        std::mem::take(&mut self.evrs)
    }

    /// Resolve a channel reference to a dictionary id: literal ids pass
    /// through, symbolic names search the binding stack innermost first.
    fn resolve(&self, channel: &ChannelRef) -> Option<ChannelId> {
        match channel {
            ChannelRef::Id(id) => Some(id.clone()),
            ChannelRef::Name(name) => self
                .bindings
                .iter()
                .rev()
                .find_map(|frame| frame.get(name))
                .cloned(),
        }
    }

    fn stamp(&self, value: &mut ChannelValue) {
        if value.sclk.is_none() {
            value.sclk = self.current_sclk;
        }
        if value.scet.is_none() {
            value.scet = self.current_scet;
        }
        value.station = self.station;
        value.vcid = self.vcid;
        value.realtime = self.realtime;
        value.unit_id = self.unit_id;
    }
}

impl DecomListener for ChannelizationListener {
    fn on_map_start(&mut self, _map: &DecomMapDefinition, bindings: &BTreeMap<String, ChannelId>) {
        self.bindings.push(bindings.clone());
    }

    fn on_map_end(&mut self, _map: &DecomMapDefinition) {
        self.bindings.pop();
    }

    fn on_time(&mut self, field: &TimeField, sclk: Sclk) {
        let next = if field.is_delta {
            match &self.current_sclk {
                Some(current) => current.increment(&sclk),
                None => sclk,
            }
        } else {
            sclk
        };
        self.current_scet = self.sclk_converter.to_scet(&next);
        self.current_sclk = Some(next);
    }

    fn on_channel(&mut self, field: &ChannelField, dn: Dn) {
        let Some(id) = self.resolve(&field.channel) else {
            debug!(channel = ?field.channel, "unresolved channel name; discarding sample");
            return;
        };
        let Some(def) = self.dict.definition(&id) else {
            debug!(channel = %id, "channel not in dictionary; discarding sample");
            return;
        };
        let mut value = ChannelValue::new(def, dn);
        self.stamp(&mut value);
        self.values.push(value);
    }

    fn on_event_record(&mut self, _field: &EvrField, evr_id: u64, args: Vec<Dn>) {
        let Some(evr_dict) = &self.evr_dict else {
            return;
        };
        let Some(def) = evr_dict.evr(evr_id) else {
            debug!(evr = evr_id, "event record not in dictionary; discarding");
            return;
        };
        let mut record = EvrRecord::new(def, args);
        record.sclk = self.current_sclk;
        record.scet = self.current_scet;
        record.station = self.station;
        record.vcid = self.vcid;
        record.realtime = self.realtime;
        record.unit_id = self.unit_id;
        self.evrs.push(record);
    }

    fn on_decommutated(&mut self, output: DecomOutput) {
        for mut value in output.values {
            // Custom decommutator output is re-stamped with the listener's
            // context, including any SCLK/SCET the algorithm set itself.
            value.sclk = None;
            value.scet = None;
            self.stamp(&mut value);
            self.values.push(value);
        }
        if self.evr_dict.is_none() {
            return;
        }
        for mut record in output.evrs {
            record.sclk = self.current_sclk;
            record.scet = self.current_scet;
            record.station = self.station;
            record.vcid = self.vcid;
            record.realtime = self.realtime;
            record.unit_id = self.unit_id;
            self.evrs.push(record);
        }
    }
}
