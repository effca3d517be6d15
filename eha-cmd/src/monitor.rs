use std::fs;
use std::fs::File;
use std::io::{stdout, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use eha::dict::{ChannelDefinitionProvider, InMemoryDictionary};
use eha::lad::ChannelLad;
use eha::monitor::DsnMonitorDecom;
use eha::msg::{MessageBus, NullBus};
use eha::publish::ChannelPublisher;
use eha::sfdu::{ChdoSfdu, SFDU_MARKER};
use eha::time::ChannelTimeComparator;
use eha::value::StationId;
use tracing::{info, warn};

pub fn monitor(
    dict_path: &Path,
    station: Option<u16>,
    output: Option<&Path>,
    input: &Path,
) -> Result<()> {
    let dict = InMemoryDictionary::from_file(dict_path)
        .with_context(|| format!("loading dictionary {dict_path:?}"))?;
    let Some(table) = dict.chdo_fields().cloned() else {
        bail!("dictionary snapshot has no chdo_fields table");
    };
    let dict_dyn: Arc<dyn ChannelDefinitionProvider> = Arc::new(dict);

    let lad = Arc::new(ChannelLad::new(
        dict_dyn.clone(),
        ChannelTimeComparator::default(),
    ));
    let publisher = Arc::new(
        ChannelPublisher::builder()
            .bus(Arc::new(NullBus) as Arc<dyn MessageBus>)
            .lad(lad.clone())
            .build(),
    );
    let decom = DsnMonitorDecom::new(&dict_dyn, publisher, station.map(StationId));

    let data = fs::read(input).with_context(|| format!("reading {input:?}"))?;
    let mut records = 0u64;
    let mut channels = 0u64;
    for (unit, chunk) in split_records(&data).enumerate() {
        match ChdoSfdu::parse(table.clone(), chunk) {
            Ok(sfdu) => {
                channels += decom.process(&sfdu, unit as u64);
                records += 1;
            }
            Err(err) => warn!(record = unit, %err, "skipping unparseable SFDU"),
        }
    }
    info!(records, channels, "monitor channelization complete");

    match output {
        Some(path) => {
            let mut out = File::create(path).with_context(|| format!("creating {path:?}"))?;
            lad.write_csv(&mut out)?;
        }
        None => {
            let mut out = stdout().lock();
            lad.write_csv(&mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Frame SFDU records by their NJPL label markers.
fn split_records(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut starts: Vec<usize> = Vec::new();
    if data.len() >= SFDU_MARKER.len() {
        for i in 0..=data.len() - SFDU_MARKER.len() {
            if &data[i..i + SFDU_MARKER.len()] == SFDU_MARKER {
                starts.push(i);
            }
        }
    }
    let mut bounds = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(data.len());
        bounds.push((start, end));
    }
    bounds.into_iter().map(move |(start, end)| &data[start..end])
}
