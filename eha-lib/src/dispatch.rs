//! Input-side orchestration.
//!
//! One worker thread per subscribed topic, each draining its own bounded
//! queue in arrival order. Topics run concurrently and independently;
//! there is no cross-topic ordering guarantee. The only state shared
//! between workers is the LAD, through the publisher.
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use hifitime::Epoch;
use tracing::{debug, info, warn};

use crate::decom::{ChannelizationListener, DecomEngine};
use crate::dict::{
    ApidMembership, ChannelDefinitionProvider, DecomMapProvider, EvrDefinitionProvider,
    HeaderFieldKind,
};
use crate::header::{FrameHeaderChannelizer, PacketHeaderChannelizer, SfduHeaderChannelizer};
use crate::input::{FrameArrived, MonitorArrived, PacketArrived, StationStatusArrived};
use crate::monitor::DsnMonitorDecom;
use crate::msg::EhaMessage;
use crate::publish::{ChannelPublisher, PublishContext};
use crate::sfdu::ChdoSfdu;
use crate::time::{wall_clock_now, SclkScetConverter};
use crate::{Error, Result};

/// Everything a dispatch worker needs, shared read-only.
pub struct EhaCore {
    pub dict: Arc<dyn ChannelDefinitionProvider>,
    pub evrs: Option<Arc<dyn EvrDefinitionProvider>>,
    pub maps: Arc<dyn DecomMapProvider>,
    pub apids: Arc<dyn ApidMembership>,
    pub publisher: Arc<ChannelPublisher>,
    pub decom: Arc<DecomEngine>,
    pub sclk_converter: Arc<dyn SclkScetConverter>,
    pub monitor: Arc<DsnMonitorDecom>,
    pub packet_headers: Arc<PacketHeaderChannelizer>,
    pub frame_headers: Arc<FrameHeaderChannelizer>,
    pub sfdu_headers: Arc<SfduHeaderChannelizer>,
}

impl EhaCore {
    fn make_listener(&self) -> ChannelizationListener {
        let listener =
            ChannelizationListener::new(Arc::clone(&self.dict), Arc::clone(&self.sclk_converter));
        match &self.evrs {
            Some(evrs) => listener.with_evr_collection(Arc::clone(evrs)),
            None => listener,
        }
    }
}

/// Spawns and feeds the per-topic workers. Dropping or shutting down the
/// dispatcher stops intake; in-flight units finish.
pub struct Dispatcher {
    packets_tx: Option<Sender<PacketArrived>>,
    frames_tx: Option<Sender<FrameArrived>>,
    monitor_tx: Option<Sender<MonitorArrived>>,
    status_tx: Option<Sender<StationStatusArrived>>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start one worker per topic, each with a bounded queue of
    /// `queue_bound` units.
    #[must_use]
    pub fn start(core: Arc<EhaCore>, queue_bound: usize) -> Self {
        let bound = queue_bound.max(1);
        let (packets_tx, packets_rx) = bounded(bound);
        let (frames_tx, frames_rx) = bounded(bound);
        let (monitor_tx, monitor_rx) = bounded(bound);
        let (status_tx, status_rx) = bounded(bound);

        let handles = vec![
            spawn_worker("eha_packet_dispatch", packets_rx, {
                let core = Arc::clone(&core);
                let mut listener = core.make_listener();
                move |packet| handle_packet(&core, &mut listener, packet)
            }),
            spawn_worker("eha_frame_dispatch", frames_rx, {
                let core = Arc::clone(&core);
                move |frame| handle_frame(&core, frame)
            }),
            spawn_worker("eha_monitor_dispatch", monitor_rx, {
                let core = Arc::clone(&core);
                move |mon: MonitorArrived| {
                    core.monitor.process(&mon.sfdu, mon.unit_id);
                }
            }),
            spawn_worker("eha_station_dispatch", status_rx, {
                let core = Arc::clone(&core);
                let mut listener = core.make_listener();
                move |status| handle_station_status(&core, &mut listener, status)
            }),
        ];

        Dispatcher {
            packets_tx: Some(packets_tx),
            frames_tx: Some(frames_tx),
            monitor_tx: Some(monitor_tx),
            status_tx: Some(status_tx),
            handles,
        }
    }

    pub fn offer_packet(&self, packet: PacketArrived) -> Result<()> {
        offer(&self.packets_tx, packet)
    }

    pub fn offer_frame(&self, frame: FrameArrived) -> Result<()> {
        offer(&self.frames_tx, frame)
    }

    pub fn offer_monitor(&self, mon: MonitorArrived) -> Result<()> {
        offer(&self.monitor_tx, mon)
    }

    pub fn offer_station_status(&self, status: StationStatusArrived) -> Result<()> {
        offer(&self.status_tx, status)
    }

    /// Stop intake and wait for in-flight units to finish.
    pub fn shutdown(mut self) {
        self.packets_tx.take();
        self.frames_tx.take();
        self.monitor_tx.take();
        self.status_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("dispatch worker panicked during shutdown");
            }
        }
        info!("dispatcher stopped");
    }
}

fn offer<T>(tx: &Option<Sender<T>>, unit: T) -> Result<()> {
    match tx {
        Some(tx) => tx
            .send(unit)
            .map_err(|_| Error::InvalidArgument("dispatcher is shut down".into())),
        None => Err(Error::InvalidArgument("dispatcher is shut down".into())),
    }
}

fn spawn_worker<T, F>(name: &str, rx: Receiver<T>, mut handler: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            // Single consumer: units of one topic are handled strictly in
            // arrival order.
            while let Ok(unit) = rx.recv() {
                handler(unit);
            }
        })
        .expect("failed to spawn dispatch worker")
}

fn handle_packet(core: &EhaCore, listener: &mut ChannelizationListener, packet: PacketArrived) {
    core.packet_headers.channelize(&packet);
    if let Some(sfdu) = &packet.sfdu {
        core.sfdu_headers
            .channelize(sfdu, HeaderFieldKind::Packet, packet.vcid, packet.unit_id);
    }

    if packet.is_fill {
        return;
    }
    let Some(apid) = packet.apid() else {
        warn!(unit = packet.unit_id, "packet too short for a primary header");
        return;
    };
    if !core.apids.is_decom_apid(apid) {
        return;
    }
    let Some(map) = core.maps.map_for_apid(apid) else {
        debug!(apid, "no decom map assigned");
        return;
    };

    listener.begin_unit(
        packet.station,
        packet.vcid,
        packet.realtime,
        Some(packet.unit_id),
        packet.sclk,
    );
    let body_offset = crate::header::CcsdsPacketHeader::LEN * 8;
    let body_len = packet.data.len() * 8 - body_offset;
    if let Err(err) = core
        .decom
        .decom(&map, &packet.data, body_offset, body_len, listener)
    {
        // A bad unit degrades only itself; whatever was accumulated before
        // the failure is still published.
        warn!(apid, unit = packet.unit_id, %err, "packet decom failed");
    }

    let values = listener.collect_channel_values();
    let evrs = listener.collect_evrs();
    if !values.is_empty() {
        let ctx = PublishContext::builder()
            .stream_id(core.publisher.gen_stream_id("FswPkt"))
            .ert(packet.ert)
            .scet(packet.scet)
            .sclk(packet.sclk)
            .realtime(packet.realtime)
            .station(packet.station)
            .vcid(packet.vcid)
            .build();
        core.publisher.publish_flight_and_derived_channels(values, &ctx);
    }
    publish_evrs(core, evrs, packet.ert);
}

fn handle_frame(core: &EhaCore, frame: FrameArrived) {
    core.frame_headers.channelize(&frame);
    if let Some(sfdu) = &frame.sfdu {
        core.sfdu_headers
            .channelize(sfdu, HeaderFieldKind::Frame, frame.vcid, frame.unit_id);
    }
}

fn handle_station_status(
    core: &EhaCore,
    listener: &mut ChannelizationListener,
    status: StationStatusArrived,
) {
    let Some(map) = core.maps.map_by_id(&status.map_id) else {
        debug!(map = %status.map_id, "no station status decom map");
        return;
    };
    listener.begin_unit(status.station, None, true, Some(status.unit_id), None);
    if let Err(err) = core.decom.decom(
        &map,
        &status.data,
        0,
        status.data.len() * 8,
        listener,
    ) {
        warn!(station = %status.station, %err, "station status decom failed");
    }
    let values = listener.collect_channel_values();
    let evrs = listener.collect_evrs();
    if !values.is_empty() {
        let ctx = PublishContext::builder()
            .stream_id(core.publisher.gen_stream_id("StationStatus"))
            .ert(status.ert)
            .realtime(true)
            .station(status.station)
            .build();
        core.publisher.publish_flight_and_derived_channels(values, &ctx);
    }
    publish_evrs(core, evrs, status.ert);
}

fn publish_evrs(core: &EhaCore, evrs: Vec<crate::evr::EvrRecord>, ert: Option<Epoch>) {
    for mut evr in evrs {
        if evr.rct.is_none() {
            evr.rct = Some(wall_clock_now());
        }
        if evr.ert.is_none() {
            evr.ert = ert;
        }
        core.publisher.bus().publish(EhaMessage::Evr(Box::new(evr)));
    }
}

/// Convenience wrapper for monitor-only processing of raw SFDU bytes, used
/// by file-driven tools.
pub fn process_monitor_bytes(
    core: &EhaCore,
    table: &crate::sfdu::ChdoFieldTable,
    data: &[u8],
    unit_id: u64,
) -> Result<u64> {
    let sfdu = ChdoSfdu::parse(table.clone(), data)?;
    Ok(core.monitor.process(&sfdu, unit_id))
}
