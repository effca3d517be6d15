//! Channel publication: timestamp backfill, EU computation, LAD update,
//! external publish, and the derivation round loop.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hifitime::Epoch;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::derive::{DerivationEngine, MAX_CYCLE};
use crate::eu::EuEngine;
use crate::lad::ChannelLad;
use crate::msg::{ChannelValueMessage, EhaMessage, MessageBus};
use crate::time::{ccsds_epoch, wall_clock_now, LocalSolarTime, LstConverter, Sclk};
use crate::value::{ChannelValue, StationId};
use crate::Vcid;

/// Per-batch publication defaults. Values that already carry a timestamp,
/// station, or VCID keep it; only unset fields are back-filled.
#[derive(TypedBuilder)]
pub struct PublishContext {
    pub stream_id: String,
    #[builder(default)]
    pub rct: Option<Epoch>,
    #[builder(default)]
    pub ert: Option<Epoch>,
    #[builder(default)]
    pub scet: Option<Epoch>,
    #[builder(default)]
    pub sclk: Option<Sclk>,
    #[builder(default)]
    pub lst: Option<LocalSolarTime>,
    #[builder(default = true)]
    pub realtime: bool,
    #[builder(default = StationId::UNSPECIFIED)]
    pub station: StationId,
    #[builder(default)]
    pub vcid: Option<Vcid>,
    /// Override the configured trigger-mode setting for this batch.
    #[builder(default)]
    pub use_triggers_override: Option<bool>,
    #[builder(default)]
    pub disable_derivations: bool,
}

/// Fans completed channel batches out to the bus and the LAD and drives
/// the derivation rounds. One publisher is shared by all dispatch
/// contexts.
#[derive(TypedBuilder)]
pub struct ChannelPublisher {
    bus: Arc<dyn MessageBus>,
    lad: Arc<ChannelLad>,
    #[builder(default)]
    eu: EuEngine,
    #[builder(default)]
    derivations: Option<Arc<DerivationEngine>>,
    #[builder(default)]
    lst_converter: Option<Arc<dyn LstConverter>>,
    #[builder(default = true)]
    derivation_enabled: bool,
    #[builder(default)]
    use_triggers: bool,
    #[builder(default)]
    from_sse: bool,
    #[builder(default, setter(skip))]
    stream_counter: AtomicU64,
}

impl ChannelPublisher {
    #[must_use]
    pub fn lad(&self) -> &Arc<ChannelLad> {
        &self.lad
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Generate a batch correlation token: wall-clock timestamp plus a
    /// process-wide counter plus a caller trailer.
    #[must_use]
    pub fn gen_stream_id(&self, trailer: &str) -> String {
        let millis = ((wall_clock_now() - ccsds_epoch()).to_seconds() * 1000.0) as u64;
        // Bounded because we will not see that many batches in one
        // millisecond.
        let seq = self.stream_counter.fetch_add(1, Ordering::Relaxed) % 100_000;
        format!("Stream{millis}-{seq}{trailer}")
    }

    /// Publish a batch: start signal, per-value backfill/EU/LAD/publish,
    /// derivation rounds (each published under a derived stream id), end
    /// signal.
    pub fn publish_flight_and_derived_channels(
        &self,
        values: Vec<ChannelValue>,
        ctx: &PublishContext,
    ) {
        self.bus.publish(EhaMessage::StartChannelProc {
            stream_id: ctx.stream_id.clone(),
        });

        let published = self.send_channel_values(values, ctx, &ctx.stream_id);

        if !ctx.disable_derivations {
            self.do_channel_derivations(&published, ctx);
        }

        self.bus.publish(EhaMessage::EndChannelProc {
            stream_id: ctx.stream_id.clone(),
        });
    }

    /// Run derivation rounds over `batch`, publishing each non-empty round
    /// so multi-level chains become visible incrementally.
    fn do_channel_derivations(&self, batch: &[ChannelValue], ctx: &PublishContext) {
        if !self.derivation_enabled || batch.is_empty() {
            return;
        }
        let Some(engine) = &self.derivations else {
            return;
        };
        let use_triggers = ctx.use_triggers_override.unwrap_or(self.use_triggers);

        // The whole chain keeps the lineage id of the originating unit
        let unit_id = batch.iter().find_map(|v| v.unit_id);

        let mut working: Vec<ChannelValue> = batch.to_vec();
        let mut cycle = 0u32;
        while !working.is_empty() {
            cycle += 1;
            if cycle > MAX_CYCLE {
                warn!("channel derivation cycle count exceeded, possible infinite loop");
                break;
            }

            let mut produced = engine.derive_round(&working, use_triggers);
            if produced.is_empty() {
                break;
            }
            for child in &mut produced {
                if child.unit_id.is_none() {
                    child.unit_id = unit_id;
                }
            }

            let stream_id = self.gen_stream_id("Derived");
            debug!(round = cycle, produced = produced.len(), "derivation round");
            working = self.send_channel_values(produced, ctx, &stream_id);
        }
    }

    /// Backfill, compute EU, insert into the LAD, and publish each value.
    /// Returns the finalized values.
    fn send_channel_values(
        &self,
        mut values: Vec<ChannelValue>,
        ctx: &PublishContext,
        stream_id: &str,
    ) -> Vec<ChannelValue> {
        for val in &mut values {
            if val.rct.is_none() {
                val.rct = ctx.rct.or_else(|| Some(wall_clock_now()));
            }
            if val.scet.is_none() {
                val.scet = ctx.scet;
            }
            if val.ert.is_none() {
                val.ert = ctx.ert;
            }
            if val.sclk.is_none() {
                val.sclk = ctx.sclk;
            }
            if val.lst.is_none() {
                val.lst = ctx.lst.or_else(|| {
                    self.lst_converter
                        .as_ref()
                        .zip(val.scet)
                        .and_then(|(conv, scet)| conv.to_lst(&scet))
                });
            }
            if val.station.is_unspecified() {
                val.station = ctx.station;
            }
            if val.vcid.is_none() {
                val.vcid = ctx.vcid;
            }
            val.realtime = ctx.realtime;

            // EU is computed immediately before the value enters the LAD so
            // conversions can consult channels published earlier in the
            // same batch.
            if val.has_eu() {
                val.eu = self.eu.compute(val, &self.lad);
            }

            if let Err(err) = self.lad.add_new_value(val.clone()) {
                warn!(channel = val.id(), %err, "LAD rejected value");
            }

            self.bus.publish(EhaMessage::ChannelValue(Box::new(
                ChannelValueMessage {
                    value: val.clone(),
                    stream_id: stream_id.to_string(),
                    from_sse: self.from_sse,
                },
            )));
        }
        values
    }
}
