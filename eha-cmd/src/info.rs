use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use eha::dict::{ChannelDefinitionType, DictionarySnapshot};

pub fn info(path: &Path) -> Result<()> {
    let snapshot: DictionarySnapshot = serde_json::from_reader(
        File::open(path).with_context(|| format!("opening {path:?}"))?,
    )
    .context("parsing dictionary snapshot")?;

    let mut flight = 0usize;
    let mut monitor = 0usize;
    let mut header = 0usize;
    for def in &snapshot.channels {
        match def.definition_type {
            ChannelDefinitionType::Flight => flight += 1,
            ChannelDefinitionType::Monitor => monitor += 1,
            ChannelDefinitionType::Header | ChannelDefinitionType::SseHeader => header += 1,
        }
    }

    println!("channels:     {}", snapshot.channels.len());
    println!("  flight:     {flight}");
    println!("  monitor:    {monitor}");
    println!("  header:     {header}");
    println!("evrs:         {}", snapshot.evrs.len());
    println!("decom maps:   {}", snapshot.decom_maps.len());
    println!("apids:        {}", snapshot.apids.len());
    println!("bit unpacks:  {}", snapshot.bit_unpacks.len());
    println!("derivations:  {}", snapshot.derivations.len());
    println!(
        "chdo fields:  {}",
        snapshot.chdo_fields.as_ref().map_or(0, |t| t.fields.len())
    );
    Ok(())
}
