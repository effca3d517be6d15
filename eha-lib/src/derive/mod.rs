//! Channel derivation: producing secondary channels from primary ones.
//!
//! One round of derivation takes a batch of just-produced values and yields
//! the values produced by bit-unpack and algorithmic derivations whose
//! parents are satisfied. The publisher drives rounds until a round is
//! empty or the cycle bound is hit, publishing each non-empty round so
//! multi-level chains become visible incrementally.
mod runner;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::dict::{
    AlgorithmicDefinition, BitUnpackDefinition, ChannelDefinitionProvider, DerivationProvider,
};
use crate::lad::ChannelLad;
use crate::time::ChannelTimeComparator;
use crate::value::{ChannelValue, Dn, StationId};

pub use runner::{
    AcvMap, AlgorithmRunner, CancelToken, DerivationAlgorithm, DerivationContext, RunOutcome,
};

/// Upper bound on derivation rounds per input batch. Exceeding it is logged
/// as a probable infinite loop and processing moves on without error.
pub const MAX_CYCLE: u32 = 10;

/// Error count at which a derivation is permanently skipped for the rest of
/// the process run.
pub const MAX_ERROR: u32 = 5;

/// The derivation engine. Shared read-only across dispatch contexts; the
/// error counters and the once-only "exceeded" set are internally locked.
pub struct DerivationEngine {
    derivations: Arc<dyn DerivationProvider>,
    dict: Arc<dyn ChannelDefinitionProvider>,
    lad: Arc<ChannelLad>,
    comparator: ChannelTimeComparator,
    runner: AlgorithmRunner,
    algorithms: HashMap<String, Arc<dyn DerivationAlgorithm>>,
    error_counts: Mutex<HashMap<String, u32>>,
    exceeded: Mutex<HashSet<String>>,
}

impl DerivationEngine {
    #[must_use]
    pub fn new(
        derivations: Arc<dyn DerivationProvider>,
        dict: Arc<dyn ChannelDefinitionProvider>,
        lad: Arc<ChannelLad>,
        comparator: ChannelTimeComparator,
        runner: AlgorithmRunner,
    ) -> Self {
        DerivationEngine {
            derivations,
            dict,
            lad,
            comparator,
            runner,
            algorithms: HashMap::new(),
            error_counts: Mutex::new(HashMap::new()),
            exceeded: Mutex::new(HashSet::new()),
        }
    }

    /// Register the executable behind an algorithmic derivation's
    /// `algorithm_id`.
    pub fn register_algorithm(&mut self, id: &str, algo: Arc<dyn DerivationAlgorithm>) -> &mut Self {
        self.algorithms.insert(id.to_string(), algo);
        self
    }

    #[must_use]
    pub fn error_count(&self, derivation_id: &str) -> u32 {
        *self
            .error_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(derivation_id)
            .unwrap_or(&0)
    }

    fn bump_error(&self, derivation_id: &str) {
        *self
            .error_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(derivation_id.to_string())
            .or_insert(0) += 1;
    }

    /// True when the derivation is past its error budget. The "exceeded"
    /// line is logged at most once per derivation id per process run.
    fn tripped(&self, derivation_id: &str) -> bool {
        if self.error_count(derivation_id) < MAX_ERROR {
            return false;
        }
        if self
            .exceeded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(derivation_id.to_string())
        {
            error!(
                derivation = derivation_id,
                "derivation has exceeded permissible error count, not run"
            );
        }
        true
    }

    /// Produce one round of derived values from `working`. The caller
    /// publishes the result and feeds it back in for the next round.
    #[must_use]
    pub fn derive_round(&self, working: &[ChannelValue], use_triggers: bool) -> Vec<ChannelValue> {
        if working.is_empty() {
            return Vec::new();
        }
        let mut produced = Vec::new();
        self.bit_unpack_round(working, &mut produced);
        if use_triggers {
            self.algorithmic_with_trigger(working, &mut produced);
        } else {
            self.algorithmic_no_trigger(working, &mut produced);
        }
        produced
    }

    fn bit_unpack_round(&self, working: &[ChannelValue], produced: &mut Vec<ChannelValue>) {
        for parent in working {
            for deriv in self.derivations.bit_unpacks_for_parent(parent.id()) {
                match self.derive_bit_unpack(&deriv, parent) {
                    Some(child) => {
                        debug!(child = child.id(), parent = parent.id(), "bit unpack");
                        produced.push(child);
                    }
                    None => continue,
                }
            }
        }
    }

    fn derive_bit_unpack(
        &self,
        deriv: &BitUnpackDefinition,
        parent: &ChannelValue,
    ) -> Option<ChannelValue> {
        let Some(dn) = parent.dn.as_u64() else {
            warn!(
                derivation = %deriv.id,
                parent = parent.id(),
                "bit unpack parent has non-integer DN"
            );
            return None;
        };
        let Some(def) = self.dict.definition(&deriv.child) else {
            warn!(
                derivation = %deriv.id,
                child = %deriv.child,
                "bit unpack child not in dictionary"
            );
            return None;
        };

        let mut out: u64 = 0;
        for range in &deriv.ranges {
            if range.start_bit + range.length > 64 || range.length == 0 {
                warn!(derivation = %deriv.id, "bit unpack range out of bounds");
                return None;
            }
            let slice = if range.length >= 64 {
                dn >> range.start_bit
            } else {
                (dn >> range.start_bit) & ((1u64 << range.length) - 1)
            };
            out = if range.length >= 64 {
                slice
            } else {
                (out << range.length) | slice
            };
        }

        let child_dn = match def.channel_type {
            crate::dict::ChannelType::SignedInt => Dn::Signed(out as i64),
            crate::dict::ChannelType::Boolean => Dn::Boolean(out != 0),
            _ => Dn::Unsigned(out),
        };
        let mut child = ChannelValue::new(def, child_dn);
        child.realtime = parent.realtime;
        child.scet = parent.scet;
        child.sclk = parent.sclk;
        child.ert = parent.ert;
        child.station = parent.station;
        child.vcid = parent.vcid;
        child.unit_id = parent.unit_id;
        Some(child)
    }

    /// Resolve one parent as the later of the batch value and the LAD
    /// value. Returns `(value, came_from_batch)`.
    fn resolve_parent(
        &self,
        id: &str,
        working_map: &AcvMap,
        realtime: bool,
        station: StationId,
    ) -> Option<(ChannelValue, bool)> {
        let in_batch = working_map.get(id);
        let from_lad = self.lad.get_most_recent_value(id, realtime, station);
        match (in_batch, from_lad) {
            (Some(batch), Some(lad)) => {
                if self.comparator.is_later(&lad, batch) {
                    Some((lad, true))
                } else {
                    Some((batch.clone(), true))
                }
            }
            (Some(batch), None) => Some((batch.clone(), true)),
            (None, Some(lad)) => Some((lad, false)),
            (None, None) => None,
        }
    }

    /// Non-triggered resolution: an algorithm runs when every declared
    /// parent resolves and at least one came from the current batch.
    fn algorithmic_no_trigger(&self, working: &[ChannelValue], produced: &mut Vec<ChannelValue>) {
        let working_map = compress(working);

        // The whole batch shares one lineage, so any value tells us the
        // realtime flag; monitor batches also decide the LAD station.
        let rep = &working[0];
        let realtime = rep.realtime;
        let station = if rep.definition_type().is_monitor() {
            rep.station
        } else {
            StationId::UNSPECIFIED
        };

        for algo in self.candidates(working) {
            let mut parents = AcvMap::with_capacity(algo.parents.len());
            let mut from_batch = 0usize;
            let mut first_parent: Option<ChannelValue> = None;

            for parent_id in &algo.parents {
                let Some((val, in_batch)) =
                    self.resolve_parent(parent_id, &working_map, realtime, station)
                else {
                    continue;
                };
                if in_batch {
                    from_batch += 1;
                    if first_parent.is_none() {
                        first_parent = working_map.get(parent_id).cloned();
                    }
                }
                parents.insert(parent_id.clone(), val);
            }

            // Pure-LAD-only runs are suppressed
            if from_batch == 0 || parents.len() != algo.parents.len() {
                continue;
            }

            let Some(children) = self.run_algorithm(&algo, parents) else {
                continue;
            };
            for mut child in children {
                if let Some(first) = &first_parent {
                    child.scet = first.scet;
                    child.sclk = first.sclk;
                    child.ert = first.ert;
                    child.lst = first.lst;
                    child.station = first.station;
                    child.vcid = first.vcid;
                }
                child.realtime = realtime;
                produced.push(child);
            }
        }
    }

    /// Triggered resolution: each batch value matching a derivation's
    /// trigger id fires that derivation once.
    fn algorithmic_with_trigger(&self, working: &[ChannelValue], produced: &mut Vec<ChannelValue>) {
        let working_map = compress(working);

        for trigger in working {
            for algo in self.derivations.algorithmics_for_trigger(trigger.id()) {
                let realtime = trigger.realtime;
                let station = if trigger.definition_type().is_monitor() {
                    trigger.station
                } else {
                    StationId::UNSPECIFIED
                };

                let mut parents = AcvMap::with_capacity(algo.parents.len());
                for parent_id in &algo.parents {
                    if let Some((val, _)) =
                        self.resolve_parent(parent_id, &working_map, realtime, station)
                    {
                        parents.insert(parent_id.clone(), val);
                    }
                }
                if parents.len() != algo.parents.len() {
                    continue;
                }

                let Some(children) = self.run_algorithm(&algo, parents) else {
                    continue;
                };
                for mut child in children {
                    child.scet = trigger.scet;
                    child.sclk = trigger.sclk;
                    child.ert = trigger.ert;
                    child.lst = trigger.lst;
                    child.station = trigger.station;
                    child.vcid = trigger.vcid;
                    child.realtime = realtime;
                    produced.push(child);
                }
            }
        }
    }

    /// Algorithms whose parent set intersects the batch, deduplicated.
    fn candidates(&self, working: &[ChannelValue]) -> Vec<Arc<AlgorithmicDefinition>> {
        let mut seen = HashSet::new();
        let mut algos = Vec::new();
        for val in working {
            for algo in self.derivations.algorithmics_for_parent(val.id()) {
                if seen.insert(algo.id.clone()) {
                    algos.push(algo);
                }
            }
        }
        algos
    }

    /// Run one algorithmic derivation under supervision, enforcing parent
    /// homogeneity and the error circuit breaker.
    fn run_algorithm(
        &self,
        algo: &AlgorithmicDefinition,
        parents: AcvMap,
    ) -> Option<Vec<ChannelValue>> {
        // Parents must be all monitor or all non-monitor
        let mut monitor_parents: Option<bool> = None;
        for parent in parents.values() {
            let is_monitor = parent.definition_type().is_monitor();
            match monitor_parents {
                None => monitor_parents = Some(is_monitor),
                Some(expected) if expected != is_monitor => {
                    if self.tripped(&algo.id) {
                        return None;
                    }
                    warn!(
                        derivation = %algo.id,
                        "mixed monitor and non-monitor parents; abandoning derivation"
                    );
                    self.bump_error(&algo.id);
                    return None;
                }
                Some(_) => {}
            }
        }

        if self.tripped(&algo.id) {
            return None;
        }

        let Some(algorithm) = self.algorithms.get(&algo.algorithm_id) else {
            warn!(
                derivation = %algo.id,
                algorithm = %algo.algorithm_id,
                "no algorithm registered; abandoning derivation"
            );
            self.bump_error(&algo.id);
            return None;
        };

        let ctx = DerivationContext {
            cancel: CancelToken::new(),
            lad: Arc::clone(&self.lad),
            dict: Arc::clone(&self.dict),
            children: algo.children.clone(),
        };

        match self
            .runner
            .run(&algo.id, Arc::clone(algorithm), parents, ctx)
        {
            RunOutcome::Completed(Ok(children)) => Some(children),
            RunOutcome::Completed(Err(err)) => {
                warn!(derivation = %algo.id, %err, "derivation algorithm failed");
                self.bump_error(&algo.id);
                None
            }
            RunOutcome::TimedOut => {
                self.bump_error(&algo.id);
                None
            }
        }
    }
}

/// Compress a working list to the latest value per channel id; later
/// entries in the batch win.
fn compress(working: &[ChannelValue]) -> AcvMap {
    let mut map = AcvMap::with_capacity(working.len());
    for val in working {
        map.insert(val.id().to_string(), val.clone());
    }
    map
}
