//! Event records produced alongside channel values in hybrid decom.
use std::fmt::Display;
use std::sync::Arc;

use hifitime::Epoch;

use crate::dict::EvrDefinition;
use crate::time::Sclk;
use crate::value::{Dn, StationId, UnitId};
use crate::Vcid;

/// One formatted, parameterized telemetry event.
#[derive(Debug, Clone)]
pub struct EvrRecord {
    pub def: Arc<EvrDefinition>,
    pub args: Vec<Dn>,
    pub message: String,
    pub realtime: bool,
    pub station: StationId,
    pub vcid: Option<Vcid>,
    pub sclk: Option<Sclk>,
    pub scet: Option<Epoch>,
    pub ert: Option<Epoch>,
    pub rct: Option<Epoch>,
    pub unit_id: Option<UnitId>,
}

impl EvrRecord {
    /// Build a record, rendering the definition's message template with the
    /// extracted arguments substituted for `%s` placeholders in order.
    #[must_use]
    pub fn new(def: Arc<EvrDefinition>, args: Vec<Dn>) -> Self {
        let message = render(&def.format, &args);
        EvrRecord {
            def,
            args,
            message,
            realtime: true,
            station: StationId::UNSPECIFIED,
            vcid: None,
            sclk: None,
            scet: None,
            ert: None,
            rct: None,
            unit_id: None,
        }
    }
}

fn render(template: &str, args: &[Dn]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut next = 0;
    let mut rest = template;
    while let Some(idx) = rest.find("%s") {
        out.push_str(&rest[..idx]);
        match args.get(next) {
            Some(arg) => out.push_str(&arg.to_string()),
            None => out.push_str("%s"),
        }
        next += 1;
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}

impl Display for EvrRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.def.name, self.def.level, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(format: &str) -> Arc<EvrDefinition> {
        Arc::new(EvrDefinition {
            id: 7,
            name: "EVR_TEST".into(),
            level: "WARNING".into(),
            format: format.into(),
        })
    }

    #[test]
    fn renders_args_in_order() {
        let rec = EvrRecord::new(
            def("mode %s entered at count %s"),
            vec![Dn::from("SAFE"), Dn::from(12u64)],
        );
        assert_eq!(rec.message, "mode SAFE entered at count 12");
    }

    #[test]
    fn missing_args_leave_placeholder() {
        let rec = EvrRecord::new(def("a=%s b=%s"), vec![Dn::from(1u64)]);
        assert_eq!(rec.message, "a=1 b=%s");
    }
}
