//! DN to EU conversion.
//!
//! The dictionary declares what conversion a channel uses
//! ([`DnToEu`](crate::dict::DnToEu)); this module evaluates it. Polynomial
//! and table conversions are built in. Algorithmic conversions are user
//! plug-ins registered by id; they get an [EuContext] so parameterized
//! conversions can consult the LAD and dictionary.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::dict::DnToEu;
use crate::lad::ChannelLad;
use crate::value::{ChannelValue, StationId};
use crate::{Error, Result, Vcid};

/// Context available to algorithmic EU conversions.
pub struct EuContext<'a> {
    pub lad: &'a ChannelLad,
    pub station: StationId,
    pub realtime: bool,
    pub vcid: Option<Vcid>,
}

/// A user-supplied EU algorithm.
pub trait AlgorithmicEu: Send + Sync {
    fn eu(&self, dn: f64, ctx: &EuContext<'_>) -> Result<f64>;
}

/// Evaluates DN to EU conversions. One engine is shared by the publisher
/// across all dispatch contexts.
#[derive(Default)]
pub struct EuEngine {
    algorithms: HashMap<String, Arc<dyn AlgorithmicEu>>,
}

impl EuEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, algorithm: Arc<dyn AlgorithmicEu>) -> &mut Self {
        self.algorithms.insert(id.to_string(), algorithm);
        self
    }

    /// Compute the EU for a value whose definition declares a conversion.
    /// Returns `None` (after logging) when the value has no numeric DN, no
    /// conversion, or the conversion fails; a failure never propagates past
    /// the single value.
    pub fn compute(&self, value: &ChannelValue, lad: &ChannelLad) -> Option<f64> {
        let conv = value.definition().dn_to_eu.as_ref()?;
        if !value.channel_type().is_numeric() {
            return None;
        }
        let dn = value.dn.as_f64()?;

        let zult = match conv {
            DnToEu::Polynomial { coefficients } => evaluate_polynomial(coefficients, dn),
            DnToEu::Table { dn: xs, eu: ys } => interpolate_table(xs, ys, dn),
            DnToEu::Algorithm { id } => match self.algorithms.get(id) {
                Some(algo) => algo.eu(
                    dn,
                    &EuContext {
                        lad,
                        station: value.station,
                        realtime: value.realtime,
                        vcid: value.vcid,
                    },
                ),
                None => Err(Error::EuConversion(format!(
                    "no EU algorithm registered for id {id}"
                ))),
            },
        };

        match zult {
            Ok(eu) => Some(eu),
            Err(err) => {
                warn!(channel = value.id(), %err, "EU conversion failed");
                None
            }
        }
    }
}

fn evaluate_polynomial(coefficients: &[f64], dn: f64) -> Result<f64> {
    if coefficients.is_empty() {
        return Err(Error::EuConversion("polynomial has no coefficients".into()));
    }
    // Horner evaluation, highest order first
    let mut eu = 0.0;
    for c in coefficients.iter().rev() {
        eu = eu * dn + c;
    }
    Ok(eu)
}

fn interpolate_table(xs: &[f64], ys: &[f64], dn: f64) -> Result<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return Err(Error::EuConversion(
            "table conversion needs matching dn/eu lists of at least 2 points".into(),
        ));
    }
    if dn < xs[0] || dn > xs[xs.len() - 1] {
        return Err(Error::EuConversion(format!(
            "dn {dn} outside table range [{}, {}]",
            xs[0],
            xs[xs.len() - 1]
        )));
    }
    for i in 1..xs.len() {
        if dn <= xs[i] {
            let span = xs[i] - xs[i - 1];
            if span <= 0.0 {
                return Err(Error::EuConversion("table dn points not increasing".into()));
            }
            let frac = (dn - xs[i - 1]) / span;
            return Ok(ys[i - 1] + frac * (ys[i] - ys[i - 1]));
        }
    }
    Ok(ys[ys.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{ChannelDefinition, ChannelType, InMemoryDictionary};
    use crate::time::ChannelTimeComparator;
    use crate::value::Dn;
    use test_case::test_case;

    fn lad() -> ChannelLad {
        ChannelLad::new(
            Arc::new(InMemoryDictionary::new()),
            ChannelTimeComparator::default(),
        )
    }

    fn value_with(conv: DnToEu, dn: Dn) -> ChannelValue {
        let def = ChannelDefinition::new("A-0100", ChannelType::UnsignedInt).with_dn_to_eu(conv);
        ChannelValue::new(Arc::new(def), dn)
    }

    #[test_case(0.0, 32.0; "zero dn")]
    #[test_case(100.0, 212.0; "boiling")]
    fn polynomial(dn: f64, expect: f64) {
        let val = value_with(
            DnToEu::Polynomial {
                coefficients: vec![32.0, 1.8],
            },
            Dn::Float(dn),
        );
        let eu = EuEngine::new().compute(&val, &lad()).unwrap();
        assert!((eu - expect).abs() < 1e-9);
    }

    #[test]
    fn table_interpolation() {
        let conv = DnToEu::Table {
            dn: vec![0.0, 10.0, 20.0],
            eu: vec![0.0, 100.0, 400.0],
        };
        let eu = EuEngine::new()
            .compute(&value_with(conv.clone(), Dn::Unsigned(15)), &lad())
            .unwrap();
        assert!((eu - 250.0).abs() < 1e-9);

        // Out of range degrades to no EU, not an error for the batch
        assert!(EuEngine::new()
            .compute(&value_with(conv, Dn::Unsigned(21)), &lad())
            .is_none());
    }

    #[test]
    fn algorithmic_plugin() {
        struct Doubler;
        impl AlgorithmicEu for Doubler {
            fn eu(&self, dn: f64, _ctx: &EuContext<'_>) -> Result<f64> {
                Ok(dn * 2.0)
            }
        }

        let mut engine = EuEngine::new();
        engine.register("doubler", Arc::new(Doubler));
        let val = value_with(
            DnToEu::Algorithm {
                id: "doubler".into(),
            },
            Dn::Unsigned(21),
        );
        assert_eq!(engine.compute(&val, &lad()), Some(42.0));
    }

    #[test]
    fn unregistered_algorithm_degrades() {
        let val = value_with(
            DnToEu::Algorithm {
                id: "nonesuch".into(),
            },
            Dn::Unsigned(1),
        );
        assert!(EuEngine::new().compute(&val, &lad()).is_none());
    }
}
