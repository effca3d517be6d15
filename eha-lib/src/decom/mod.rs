//! Map-driven generic decommutation.
//!
//! [DecomEngine] walks a [DecomMapDefinition] against a bit buffer and
//! raises typed field events on a [DecomListener]. The engine decodes raw
//! bits only; interpretation (channel resolution, time context, EVR
//! assembly) belongs to the listener.
mod listener;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::bits::BitBuffer;
use crate::dict::{
    AlgorithmCall, BooleanField, ChannelField, ChannelId, ChannelType, DecomMapDefinition,
    DecomMapProvider, DecomStatement, DynamicArrayField, EnumField, EvrField, FloatField,
    IntegerField, MapReference, OpcodeField, StaticArrayField, TextField, TimeField,
};
use crate::evr::EvrRecord;
use crate::time::Sclk;
use crate::value::{ChannelValue, Dn};
use crate::{Error, Result};

pub use listener::ChannelizationListener;

/// Map references may nest this deep before decom aborts. Guards against
/// reference cycles in a bad map dictionary.
const MAX_MAP_DEPTH: usize = 16;

/// A decom variable, stored by `store` fields and consumed by dynamic
/// array lengths and algorithm arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum DecomValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

impl DecomValue {
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DecomValue::Uint(v) => Some(*v),
            DecomValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// Output of a custom decommutator algorithm.
#[derive(Debug, Default)]
pub struct DecomOutput {
    pub values: Vec<ChannelValue>,
    pub evrs: Vec<EvrRecord>,
}

/// A pluggable decommutator invoked by algorithm statements. It reads from
/// the live buffer at the current cursor and returns derived channel values
/// and event records, which the listener re-stamps with its current
/// time/station context.
pub trait Decommutator: Send + Sync {
    fn decom(
        &self,
        buffer: &mut BitBuffer<'_>,
        args: &HashMap<String, DecomValue>,
    ) -> Result<DecomOutput>;
}

/// Receives typed field events from the engine. All callbacks default to
/// no-ops so a listener implements only what it consumes.
#[allow(unused_variables)]
pub trait DecomListener {
    /// A map (root or referenced) is entered. `bindings` carries the
    /// name-to-channel-id rebindings of the referencing statement; empty
    /// for the root map.
    fn on_map_start(&mut self, map: &DecomMapDefinition, bindings: &BTreeMap<String, ChannelId>) {}
    /// The map entered by the matching [on_map_start](Self::on_map_start)
    /// is finished. Always paired, also on decom error.
    fn on_map_end(&mut self, map: &DecomMapDefinition) {}
    fn on_integer(&mut self, field: &IntegerField, val: i64) {}
    fn on_unsigned(&mut self, field: &IntegerField, val: u64) {}
    fn on_float(&mut self, field: &FloatField, val: f64) {}
    fn on_text(&mut self, field: &TextField, val: &str) {}
    fn on_boolean(&mut self, field: &BooleanField, val: bool) {}
    fn on_enum(&mut self, field: &EnumField, val: i64) {}
    fn on_time(&mut self, field: &TimeField, sclk: Sclk) {}
    fn on_channel(&mut self, field: &ChannelField, dn: Dn) {}
    fn on_opcode(&mut self, field: &OpcodeField, val: u64) {}
    fn on_event_record(&mut self, field: &EvrField, evr_id: u64, args: Vec<Dn>) {}
    fn on_decommutated(&mut self, output: DecomOutput) {}
}

/// Drives decommutation of one bit buffer at a time. Stateless between
/// calls; safe to share behind an `Arc` across dispatch contexts as long as
/// each call gets its own listener.
pub struct DecomEngine {
    maps: Arc<dyn DecomMapProvider>,
    decommutators: HashMap<String, Arc<dyn Decommutator>>,
}

impl DecomEngine {
    #[must_use]
    pub fn new(maps: Arc<dyn DecomMapProvider>) -> Self {
        DecomEngine {
            maps,
            decommutators: HashMap::new(),
        }
    }

    pub fn register_decommutator(&mut self, id: &str, algo: Arc<dyn Decommutator>) -> &mut Self {
        self.decommutators.insert(id.to_string(), algo);
        self
    }

    /// Walk `map` over `len` bits of `data` starting at bit `offset`,
    /// raising events on `listener`.
    pub fn decom(
        &self,
        map: &DecomMapDefinition,
        data: &[u8],
        offset: usize,
        len: usize,
        listener: &mut dyn DecomListener,
    ) -> Result<()> {
        let mut buf = BitBuffer::wrap(data, offset, len)?;
        let mut vars: HashMap<String, DecomValue> = HashMap::new();
        self.run_map(map, &BTreeMap::new(), &mut buf, &mut vars, listener, 0)
    }

    fn run_map(
        &self,
        map: &DecomMapDefinition,
        bindings: &BTreeMap<String, ChannelId>,
        buf: &mut BitBuffer<'_>,
        vars: &mut HashMap<String, DecomValue>,
        listener: &mut dyn DecomListener,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_MAP_DEPTH {
            return Err(Error::Decom(format!(
                "decom map reference depth exceeds {MAX_MAP_DEPTH}; reference cycle in map {}",
                map.id
            )));
        }
        listener.on_map_start(map, bindings);
        let zult = self.run_statements(&map.statements, buf, vars, listener, depth);
        // Fire unconditionally so listener binding scopes stay balanced
        listener.on_map_end(map);
        zult
    }

    fn run_statements(
        &self,
        statements: &[DecomStatement],
        buf: &mut BitBuffer<'_>,
        vars: &mut HashMap<String, DecomValue>,
        listener: &mut dyn DecomListener,
        depth: usize,
    ) -> Result<()> {
        for stmt in statements {
            self.execute(stmt, buf, vars, listener, depth)?;
        }
        Ok(())
    }

    fn execute(
        &self,
        stmt: &DecomStatement,
        buf: &mut BitBuffer<'_>,
        vars: &mut HashMap<String, DecomValue>,
        listener: &mut dyn DecomListener,
        depth: usize,
    ) -> Result<()> {
        match stmt {
            DecomStatement::Integer(field) => {
                if field.unsigned {
                    let val = buf.get_u64(field.bits as usize)?;
                    if field.store {
                        vars.insert(field.name.clone(), DecomValue::Uint(val));
                    }
                    listener.on_unsigned(field, val);
                } else {
                    let val = buf.get_i64(field.bits as usize)?;
                    if field.store {
                        vars.insert(field.name.clone(), DecomValue::Int(val));
                    }
                    listener.on_integer(field, val);
                }
            }
            DecomStatement::Float(field) => {
                let val = match field.bits {
                    32 => f64::from(buf.get_f32()?),
                    64 => buf.get_f64()?,
                    other => {
                        return Err(Error::Decom(format!(
                            "float field {} has unsupported width {other}",
                            field.name
                        )))
                    }
                };
                listener.on_float(field, val);
            }
            DecomStatement::Text(field) => {
                let val = buf.get_ascii(field.length as usize)?;
                if field.store {
                    vars.insert(field.name.clone(), DecomValue::Text(val.clone()));
                }
                listener.on_text(field, &val);
            }
            DecomStatement::Boolean(field) => {
                let val = buf.get_u64(field.bits as usize)? != 0;
                listener.on_boolean(field, val);
            }
            DecomStatement::Enum(field) => {
                let val = buf.get_i64(field.bits as usize)?;
                listener.on_enum(field, val);
            }
            DecomStatement::Time(field) => {
                let coarse = buf.get_u64(field.coarse_bits as usize)?;
                let fine = buf.get_u64(field.fine_bits as usize)? as u32;
                let fine_modulus = if field.fine_bits >= 32 {
                    u32::MAX
                } else {
                    1u32 << field.fine_bits
                };
                listener.on_time(
                    field,
                    Sclk {
                        coarse,
                        fine,
                        fine_modulus,
                    },
                );
            }
            DecomStatement::Skip { bits } => buf.skip(*bits as usize)?,
            DecomStatement::Channel(field) => self.execute_channel(field, buf, listener)?,
            DecomStatement::StaticArray(StaticArrayField { count, statements }) => {
                for _ in 0..*count {
                    self.run_statements(statements, buf, vars, listener, depth)?;
                }
            }
            DecomStatement::DynamicArray(DynamicArrayField {
                length_variable,
                statements,
            }) => {
                let count = vars
                    .get(length_variable)
                    .and_then(DecomValue::as_u64)
                    .ok_or_else(|| {
                        Error::Decom(format!(
                            "dynamic array length variable {length_variable} is missing or non-numeric"
                        ))
                    })?;
                for _ in 0..count {
                    self.run_statements(statements, buf, vars, listener, depth)?;
                }
            }
            DecomStatement::MapReference(MapReference {
                map_id,
                channel_bindings,
            }) => {
                let referenced = self.maps.map_by_id(map_id).ok_or_else(|| {
                    Error::Decom(format!("no decom map with id {map_id}"))
                })?;
                self.run_map(&referenced, channel_bindings, buf, vars, listener, depth + 1)?;
            }
            DecomStatement::Algorithm(AlgorithmCall { algorithm_id, args }) => {
                let algo = self.decommutators.get(algorithm_id).ok_or_else(|| {
                    Error::Decom(format!("no decommutator registered for id {algorithm_id}"))
                })?;
                let mut resolved: HashMap<String, DecomValue> = HashMap::with_capacity(args.len());
                for (name, var) in args {
                    let val = vars.get(var).ok_or_else(|| {
                        Error::Decom(format!(
                            "decommutator {algorithm_id} argument {name} references missing variable {var}"
                        ))
                    })?;
                    resolved.insert(name.clone(), val.clone());
                }
                let output = algo.decom(buf, &resolved)?;
                listener.on_decommutated(output);
            }
            DecomStatement::Opcode(field) => {
                let val = buf.get_u64(field.bits as usize)?;
                listener.on_opcode(field, val);
            }
            DecomStatement::EventRecord(field) => {
                let evr_id = buf.get_u64(field.id_bits as usize)?;
                let mut evr_args = Vec::with_capacity(field.arg_widths.len());
                for width in &field.arg_widths {
                    evr_args.push(Dn::Unsigned(buf.get_u64(*width as usize)?));
                }
                listener.on_event_record(field, evr_id, evr_args);
            }
        }
        Ok(())
    }

    fn execute_channel(
        &self,
        field: &ChannelField,
        buf: &mut BitBuffer<'_>,
        listener: &mut dyn DecomListener,
    ) -> Result<()> {
        let width = field.width as usize;
        if let Some(offset) = field.offset {
            buf.mark();
            buf.set_position(offset as usize)?;
        }

        let position = buf.position();
        let dn = match field.channel_type {
            // Signed data is decommed as unsigned when the field is not
            // byte-sized and byte-aligned, preserving legacy channel
            // statement behavior.
            ChannelType::SignedInt | ChannelType::Status => {
                if width % 8 == 0 && position % 8 == 0 {
                    Dn::Signed(buf.get_i64(width)?)
                } else {
                    Dn::Unsigned(buf.get_u64(width)?)
                }
            }
            ChannelType::UnsignedInt | ChannelType::Digital | ChannelType::Time => {
                Dn::Unsigned(buf.get_u64(width)?)
            }
            ChannelType::Boolean => Dn::Boolean(buf.get_u64(width)? != 0),
            ChannelType::Float => match width {
                32 => Dn::Float(f64::from(buf.get_f32()?)),
                64 => Dn::Float(buf.get_f64()?),
                other => {
                    return Err(Error::Decom(format!(
                        "float channel width must be 32 or 64, got {other}"
                    )))
                }
            },
            ChannelType::Ascii => Dn::Text(buf.get_ascii(width / 8)?),
        };

        if field.offset.is_some() {
            buf.reset()?;
        }
        listener.on_channel(field, dn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{ChannelRef, InMemoryDictionary};

    #[derive(Default)]
    struct Recorder {
        unsigned: Vec<u64>,
        channels: Vec<Dn>,
        times: Vec<Sclk>,
        maps: Vec<String>,
    }

    impl DecomListener for Recorder {
        fn on_map_start(
            &mut self,
            map: &DecomMapDefinition,
            _bindings: &BTreeMap<String, ChannelId>,
        ) {
            self.maps.push(format!("start:{}", map.id));
        }
        fn on_map_end(&mut self, map: &DecomMapDefinition) {
            self.maps.push(format!("end:{}", map.id));
        }
        fn on_unsigned(&mut self, _field: &IntegerField, val: u64) {
            self.unsigned.push(val);
        }
        fn on_channel(&mut self, _field: &ChannelField, dn: Dn) {
            self.channels.push(dn);
        }
        fn on_time(&mut self, _field: &TimeField, sclk: Sclk) {
            self.times.push(sclk);
        }
    }

    fn engine_with(maps: Vec<DecomMapDefinition>) -> DecomEngine {
        let mut dict = InMemoryDictionary::new();
        for map in maps {
            dict.add_map(map);
        }
        DecomEngine::new(Arc::new(dict))
    }

    fn chan_stmt(width: u32) -> DecomStatement {
        DecomStatement::Channel(ChannelField {
            channel: ChannelRef::Id("A-0001".into()),
            channel_type: ChannelType::UnsignedInt,
            width,
            offset: None,
        })
    }

    #[test]
    fn dynamic_array_consumes_stored_length() {
        let map = DecomMapDefinition::new(
            "root",
            vec![
                DecomStatement::Integer(IntegerField {
                    name: "n".into(),
                    bits: 8,
                    unsigned: true,
                    store: true,
                }),
                DecomStatement::DynamicArray(DynamicArrayField {
                    length_variable: "n".into(),
                    statements: vec![chan_stmt(8)],
                }),
            ],
        );
        let engine = engine_with(vec![]);
        let mut rec = Recorder::default();
        let data = [3u8, 0xa, 0xb, 0xc];
        engine.decom(&map, &data, 0, 32, &mut rec).unwrap();
        assert_eq!(rec.unsigned, vec![3]);
        assert_eq!(
            rec.channels,
            vec![Dn::Unsigned(0xa), Dn::Unsigned(0xb), Dn::Unsigned(0xc)]
        );
    }

    #[test]
    fn map_reference_walks_referenced_map() {
        let inner = DecomMapDefinition::new("inner", vec![chan_stmt(8)]);
        let root = DecomMapDefinition::new(
            "root",
            vec![DecomStatement::MapReference(MapReference {
                map_id: "inner".into(),
                channel_bindings: BTreeMap::new(),
            })],
        );
        let engine = engine_with(vec![inner]);
        let mut rec = Recorder::default();
        engine.decom(&root, &[0x7f], 0, 8, &mut rec).unwrap();
        assert_eq!(rec.channels, vec![Dn::Unsigned(0x7f)]);
        assert_eq!(
            rec.maps,
            vec!["start:root", "start:inner", "end:inner", "end:root"]
        );
    }

    #[test]
    fn self_referencing_map_hits_depth_limit() {
        let root = DecomMapDefinition::new(
            "loop",
            vec![DecomStatement::MapReference(MapReference {
                map_id: "loop".into(),
                channel_bindings: BTreeMap::new(),
            })],
        );
        let engine = engine_with(vec![root.clone()]);
        let mut rec = Recorder::default();
        let err = engine
            .decom(&root, &[0u8; 8], 0, 64, &mut rec)
            .unwrap_err();
        assert!(matches!(err, Error::Decom(_)));
        // map_end fired for every map_start despite the error
        let starts = rec.maps.iter().filter(|m| m.starts_with("start")).count();
        let ends = rec.maps.iter().filter(|m| m.starts_with("end")).count();
        assert_eq!(starts, ends);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let map = DecomMapDefinition::new("root", vec![chan_stmt(16)]);
        let engine = engine_with(vec![]);
        let mut rec = Recorder::default();
        assert!(engine.decom(&map, &[0xff], 0, 8, &mut rec).is_err());
    }

    #[test]
    fn time_statement_extracts_sclk() {
        let map = DecomMapDefinition::new(
            "root",
            vec![DecomStatement::Time(TimeField {
                is_delta: false,
                coarse_bits: 32,
                fine_bits: 16,
            })],
        );
        let engine = engine_with(vec![]);
        let mut rec = Recorder::default();
        let data = [0x00, 0x00, 0x01, 0x00, 0x80, 0x00];
        engine.decom(&map, &data, 0, 48, &mut rec).unwrap();
        assert_eq!(rec.times[0].coarse, 256);
        assert_eq!(rec.times[0].fine, 0x8000);
        assert_eq!(rec.times[0].fine_modulus, 65_536);
    }

    #[test]
    fn offset_override_restores_cursor() {
        let map = DecomMapDefinition::new(
            "root",
            vec![
                DecomStatement::Channel(ChannelField {
                    channel: ChannelRef::Id("A-0001".into()),
                    channel_type: ChannelType::UnsignedInt,
                    width: 8,
                    offset: Some(8),
                }),
                chan_stmt(8),
            ],
        );
        let engine = engine_with(vec![]);
        let mut rec = Recorder::default();
        engine.decom(&map, &[0x11, 0x22], 0, 16, &mut rec).unwrap();
        // First read comes from the override offset, second from the
        // restored cursor.
        assert_eq!(rec.channels, vec![Dn::Unsigned(0x22), Dn::Unsigned(0x11)]);
    }
}
