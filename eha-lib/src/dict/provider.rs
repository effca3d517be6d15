//! Provider contracts the core requires from its dictionary collaborator,
//! plus the in-memory implementation used by embedders and tests.
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    AlgorithmicDefinition, BitUnpackDefinition, ChannelDefinition, ChannelId, DecomMapDefinition,
    DecomMapId, EvrDefinition,
};
use crate::sfdu::ChdoFieldTable;
use crate::{Apid, Result};

/// Channel definition lookups.
pub trait ChannelDefinitionProvider: Send + Sync {
    fn definition(&self, id: &str) -> Option<Arc<ChannelDefinition>>;
    /// Lookup by monitor dictionary index (the wire channel number).
    fn definition_by_index(&self, index: u32) -> Option<Arc<ChannelDefinition>>;
    fn definitions(&self) -> Vec<Arc<ChannelDefinition>>;
}

/// Decom map lookups.
pub trait DecomMapProvider: Send + Sync {
    fn map_for_apid(&self, apid: Apid) -> Option<Arc<DecomMapDefinition>>;
    fn map_by_id(&self, id: &str) -> Option<Arc<DecomMapDefinition>>;
}

/// Event record definition lookups.
pub trait EvrDefinitionProvider: Send + Sync {
    fn evr(&self, id: u64) -> Option<Arc<EvrDefinition>>;
}

/// APID membership sets used by the dispatcher to route packets.
pub trait ApidMembership: Send + Sync {
    fn is_decom_apid(&self, apid: Apid) -> bool;
    fn is_eha_apid(&self, apid: Apid) -> bool;
}

/// Parent/child derivation index.
pub trait DerivationProvider: Send + Sync {
    fn bit_unpacks_for_parent(&self, parent: &str) -> Vec<Arc<BitUnpackDefinition>>;
    fn algorithmics_for_parent(&self, parent: &str) -> Vec<Arc<AlgorithmicDefinition>>;
    fn algorithmics_for_trigger(&self, trigger: &str) -> Vec<Arc<AlgorithmicDefinition>>;
}

/// APID to decom-map assignment in a [DictionarySnapshot].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApidMapEntry {
    pub apid: Apid,
    pub map_id: DecomMapId,
    /// Whether the APID also belongs to the prechannelized EHA set.
    #[serde(default)]
    pub eha: bool,
}

/// Serializable snapshot of a dictionary, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionarySnapshot {
    #[serde(default)]
    pub channels: Vec<ChannelDefinition>,
    #[serde(default)]
    pub evrs: Vec<EvrDefinition>,
    #[serde(default)]
    pub decom_maps: Vec<DecomMapDefinition>,
    #[serde(default)]
    pub apids: Vec<ApidMapEntry>,
    #[serde(default)]
    pub bit_unpacks: Vec<BitUnpackDefinition>,
    #[serde(default)]
    pub derivations: Vec<AlgorithmicDefinition>,
    /// CHDO field table of the station configuration, when the snapshot
    /// carries one.
    #[serde(default)]
    pub chdo_fields: Option<ChdoFieldTable>,
}

/// Dictionary provider backed by in-memory maps. Built once, then shared
/// read-only.
#[derive(Default)]
pub struct InMemoryDictionary {
    channels: HashMap<ChannelId, Arc<ChannelDefinition>>,
    by_index: HashMap<u32, Arc<ChannelDefinition>>,
    evrs: HashMap<u64, Arc<EvrDefinition>>,
    maps: HashMap<DecomMapId, Arc<DecomMapDefinition>>,
    apid_maps: HashMap<Apid, DecomMapId>,
    eha_apids: HashSet<Apid>,
    bit_unpacks: HashMap<ChannelId, Vec<Arc<BitUnpackDefinition>>>,
    algos_by_parent: HashMap<ChannelId, Vec<Arc<AlgorithmicDefinition>>>,
    algos_by_trigger: HashMap<ChannelId, Vec<Arc<AlgorithmicDefinition>>>,
    chdo_fields: Option<ChdoFieldTable>,
}

impl InMemoryDictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a [DictionarySnapshot] from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let snapshot: DictionarySnapshot = serde_json::from_reader(File::open(path)?)?;
        Ok(Self::from_snapshot(snapshot))
    }

    #[must_use]
    pub fn from_snapshot(snapshot: DictionarySnapshot) -> Self {
        let mut dict = Self::new();
        for def in snapshot.channels {
            dict.add_channel(def);
        }
        for evr in snapshot.evrs {
            dict.add_evr(evr);
        }
        for map in snapshot.decom_maps {
            dict.add_map(map);
        }
        for entry in snapshot.apids {
            dict.assign_apid(entry.apid, &entry.map_id, entry.eha);
        }
        for unpack in snapshot.bit_unpacks {
            dict.add_bit_unpack(unpack);
        }
        for algo in snapshot.derivations {
            dict.add_algorithmic(algo);
        }
        dict.chdo_fields = snapshot.chdo_fields;
        dict
    }

    /// CHDO field table carried by the loaded snapshot, if any.
    #[must_use]
    pub fn chdo_fields(&self) -> Option<&ChdoFieldTable> {
        self.chdo_fields.as_ref()
    }

    pub fn add_channel(&mut self, def: ChannelDefinition) -> &mut Self {
        let def = Arc::new(def);
        if let Some(index) = def.index {
            self.by_index.insert(index, Arc::clone(&def));
        }
        self.channels.insert(def.id.clone(), def);
        self
    }

    pub fn add_evr(&mut self, def: EvrDefinition) -> &mut Self {
        self.evrs.insert(def.id, Arc::new(def));
        self
    }

    pub fn add_map(&mut self, map: DecomMapDefinition) -> &mut Self {
        self.maps.insert(map.id.clone(), Arc::new(map));
        self
    }

    pub fn assign_apid(&mut self, apid: Apid, map_id: &str, eha: bool) -> &mut Self {
        self.apid_maps.insert(apid, map_id.to_string());
        if eha {
            self.eha_apids.insert(apid);
        }
        self
    }

    pub fn add_bit_unpack(&mut self, def: BitUnpackDefinition) -> &mut Self {
        self.bit_unpacks
            .entry(def.parent.clone())
            .or_default()
            .push(Arc::new(def));
        self
    }

    pub fn add_algorithmic(&mut self, def: AlgorithmicDefinition) -> &mut Self {
        let def = Arc::new(def);
        for parent in &def.parents {
            self.algos_by_parent
                .entry(parent.clone())
                .or_default()
                .push(Arc::clone(&def));
        }
        if let Some(trigger) = &def.trigger_id {
            self.algos_by_trigger
                .entry(trigger.clone())
                .or_default()
                .push(Arc::clone(&def));
        }
        self
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl ChannelDefinitionProvider for InMemoryDictionary {
    fn definition(&self, id: &str) -> Option<Arc<ChannelDefinition>> {
        self.channels.get(id).cloned()
    }

    fn definition_by_index(&self, index: u32) -> Option<Arc<ChannelDefinition>> {
        self.by_index.get(&index).cloned()
    }

    fn definitions(&self) -> Vec<Arc<ChannelDefinition>> {
        let mut defs: Vec<_> = self.channels.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }
}

impl DecomMapProvider for InMemoryDictionary {
    fn map_for_apid(&self, apid: Apid) -> Option<Arc<DecomMapDefinition>> {
        self.apid_maps
            .get(&apid)
            .and_then(|id| self.maps.get(id).cloned())
    }

    fn map_by_id(&self, id: &str) -> Option<Arc<DecomMapDefinition>> {
        self.maps.get(id).cloned()
    }
}

impl EvrDefinitionProvider for InMemoryDictionary {
    fn evr(&self, id: u64) -> Option<Arc<EvrDefinition>> {
        self.evrs.get(&id).cloned()
    }
}

impl ApidMembership for InMemoryDictionary {
    fn is_decom_apid(&self, apid: Apid) -> bool {
        self.apid_maps.contains_key(&apid)
    }

    fn is_eha_apid(&self, apid: Apid) -> bool {
        self.eha_apids.contains(&apid)
    }
}

impl DerivationProvider for InMemoryDictionary {
    fn bit_unpacks_for_parent(&self, parent: &str) -> Vec<Arc<BitUnpackDefinition>> {
        self.bit_unpacks.get(parent).cloned().unwrap_or_default()
    }

    fn algorithmics_for_parent(&self, parent: &str) -> Vec<Arc<AlgorithmicDefinition>> {
        self.algos_by_parent.get(parent).cloned().unwrap_or_default()
    }

    fn algorithmics_for_trigger(&self, trigger: &str) -> Vec<Arc<AlgorithmicDefinition>> {
        self.algos_by_trigger
            .get(trigger)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::ChannelType;

    #[test]
    fn snapshot_load() {
        let text = r#"{
            "channels": [
                {"id": "A-0001", "channel_type": "unsigned_int"},
                {"id": "M-0005", "channel_type": "unsigned_int",
                 "definition_type": "monitor", "index": 5}
            ],
            "decom_maps": [{"id": "main", "statements": []}],
            "apids": [{"apid": 100, "map_id": "main", "eha": true}],
            "derivations": [
                {"id": "d1", "parents": ["A-0001"], "children": ["A-0002"],
                 "algorithm_id": "sum"}
            ]
        }"#;
        let snapshot: DictionarySnapshot = serde_json::from_str(text).unwrap();
        let dict = InMemoryDictionary::from_snapshot(snapshot);

        assert_eq!(dict.channel_count(), 2);
        assert!(dict.definition("A-0001").is_some());
        assert_eq!(dict.definition_by_index(5).unwrap().id, "M-0005");
        assert!(dict.map_for_apid(100).is_some());
        assert!(dict.is_decom_apid(100));
        assert!(dict.is_eha_apid(100));
        assert!(!dict.is_decom_apid(101));
        assert_eq!(dict.algorithmics_for_parent("A-0001").len(), 1);
        assert!(dict.algorithmics_for_trigger("A-0001").is_empty());
    }

    #[test]
    fn definitions_sorted_by_id() {
        let mut dict = InMemoryDictionary::new();
        dict.add_channel(ChannelDefinition::new("B-0002", ChannelType::Float));
        dict.add_channel(ChannelDefinition::new("A-0001", ChannelType::Float));
        let ids: Vec<_> = dict.definitions().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["A-0001", "B-0002"]);
    }
}
