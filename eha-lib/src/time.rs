//! Timestamp domains attached to channel values.
//!
//! Every channel value may carry up to four time points: SCLK (spacecraft
//! clock), SCET (spacecraft event time), ERT (earth receive time), and RCT
//! (record creation time). SCLK is a raw counter; the other three are
//! [`hifitime::Epoch`]s.
use std::cmp::Ordering;
use std::fmt::Display;

use hifitime::{Duration, Epoch};
use serde::{Deserialize, Serialize};

use crate::value::ChannelValue;

/// Number of seconds between 1900 (hifitime's TAI reference) and the 1958
/// CCSDS epoch.
pub const CCSDS_HIFIEPOCH_DELTA_SECS: u64 = 1_830_297_600;

/// Default modulus of the SCLK fine counter (16-bit subseconds).
pub const DEFAULT_FINE_MODULUS: u32 = 65_536;

/// Spacecraft clock: a coarse seconds counter plus a fine subseconds counter
/// counting in units of `1/fine_modulus` seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sclk {
    pub coarse: u64,
    pub fine: u32,
    pub fine_modulus: u32,
}

impl Sclk {
    pub const ZERO: Sclk = Sclk {
        coarse: 0,
        fine: 0,
        fine_modulus: DEFAULT_FINE_MODULUS,
    };

    #[must_use]
    pub fn new(coarse: u64, fine: u32) -> Self {
        Sclk {
            coarse,
            fine,
            fine_modulus: DEFAULT_FINE_MODULUS,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.coarse == 0 && self.fine == 0
    }

    /// Whole clock value in seconds, including the fractional fine part.
    #[must_use]
    pub fn as_secs(&self) -> f64 {
        self.coarse as f64 + f64::from(self.fine) / f64::from(self.fine_modulus.max(1))
    }

    /// Add another SCLK interpreted as a delta. Fine counts carry into
    /// coarse at the fine modulus of `self`.
    #[must_use]
    pub fn increment(&self, delta: &Sclk) -> Sclk {
        let modulus = self.fine_modulus.max(1);
        let fine_sum = u64::from(self.fine) + u64::from(delta.fine);
        Sclk {
            coarse: self.coarse + delta.coarse + fine_sum / u64::from(modulus),
            fine: (fine_sum % u64::from(modulus)) as u32,
            fine_modulus: self.fine_modulus,
        }
    }
}

impl PartialEq for Sclk {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Sclk {}

impl PartialOrd for Sclk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sclk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.coarse.cmp(&other.coarse).then_with(|| {
            // Compare fine counts as fractions so differing moduli order
            // correctly.
            let a = u64::from(self.fine) * u64::from(other.fine_modulus.max(1));
            let b = u64::from(other.fine) * u64::from(self.fine_modulus.max(1));
            a.cmp(&b)
        })
    }
}

impl Display for Sclk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.coarse, self.fine)
    }
}

/// Current wall-clock time as an [Epoch]. Used for RCT stamping.
#[must_use]
pub fn wall_clock_now() -> Epoch {
    Epoch::now().unwrap_or_else(|_| ccsds_epoch())
}

/// The 1958 CCSDS epoch as a hifitime [Epoch].
#[must_use]
pub fn ccsds_epoch() -> Epoch {
    Epoch::from_utc_duration(Duration::from_seconds(CCSDS_HIFIEPOCH_DELTA_SECS as f64))
}

/// Convert milliseconds past the 1958 CCSDS epoch to an [Epoch]. This is the
/// time encoding used by CHDO date fields.
#[must_use]
pub fn epoch_from_ccsds_millis(millis: u64) -> Epoch {
    ccsds_epoch() + Duration::from_milliseconds(millis as f64)
}

/// SCLK to SCET correlation.
pub trait SclkScetConverter: Send + Sync {
    fn to_scet(&self, sclk: &Sclk) -> Option<Epoch>;
}

/// Linear correlation: `scet = epoch + sclk * rate`. Suitable when the
/// ground correlation file reduces to a single segment.
pub struct LinearSclkScetConverter {
    epoch: Epoch,
    rate: f64,
}

impl LinearSclkScetConverter {
    #[must_use]
    pub fn new(epoch: Epoch, rate: f64) -> Self {
        LinearSclkScetConverter { epoch, rate }
    }
}

impl Default for LinearSclkScetConverter {
    fn default() -> Self {
        LinearSclkScetConverter {
            epoch: ccsds_epoch(),
            rate: 1.0,
        }
    }
}

impl SclkScetConverter for LinearSclkScetConverter {
    fn to_scet(&self, sclk: &Sclk) -> Option<Epoch> {
        let secs = sclk.as_secs() * self.rate;
        if !secs.is_finite() {
            return None;
        }
        Some(self.epoch + Duration::from_seconds(secs))
    }
}

/// Local solar time at the landed asset, carried on values only when LST
/// generation is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSolarTime {
    pub sol: u32,
    pub ms_of_sol: u64,
}

impl Display for LocalSolarTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SOL-{:04}M{}", self.sol, self.ms_of_sol)
    }
}

/// SCET to local-solar-time conversion for missions that enable it.
pub trait LstConverter: Send + Sync {
    fn to_lst(&self, scet: &Epoch) -> Option<LocalSolarTime>;
}

/// Which timestamp domain decides "newer" when two samples of the same
/// channel compete, e.g. for a LAD slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeComparisonStrategy {
    #[default]
    Scet,
    Ert,
    Sclk,
    /// Arrival order wins; every candidate is considered later.
    LastReceived,
}

/// Compares two channel values under a [TimeComparisonStrategy].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelTimeComparator {
    strategy: TimeComparisonStrategy,
}

impl ChannelTimeComparator {
    #[must_use]
    pub fn new(strategy: TimeComparisonStrategy) -> Self {
        ChannelTimeComparator { strategy }
    }

    #[must_use]
    pub fn strategy(&self) -> TimeComparisonStrategy {
        self.strategy
    }

    /// True if `candidate` is strictly later than `current`. Ties are not
    /// later, so callers keep what they already have. A candidate missing
    /// the compared timestamp is never later; a current value missing it is
    /// always superseded.
    #[must_use]
    pub fn is_later(&self, candidate: &ChannelValue, current: &ChannelValue) -> bool {
        match self.strategy {
            TimeComparisonStrategy::LastReceived => true,
            TimeComparisonStrategy::Scet => later_of(candidate.scet, current.scet),
            TimeComparisonStrategy::Ert => later_of(candidate.ert, current.ert),
            TimeComparisonStrategy::Sclk => match (&candidate.sclk, &current.sclk) {
                (Some(a), Some(b)) => a > b,
                (Some(_), None) => true,
                _ => false,
            },
        }
    }
}

fn later_of(candidate: Option<Epoch>, current: Option<Epoch>) -> bool {
    match (candidate, current) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sclk_ordering() {
        assert!(Sclk::new(2, 0) > Sclk::new(1, 65_535));
        assert!(Sclk::new(1, 10) > Sclk::new(1, 9));
        assert_eq!(Sclk::new(5, 5), Sclk::new(5, 5));
    }

    #[test]
    fn sclk_increment_carries_fine() {
        let base = Sclk::new(10, 65_000);
        let sum = base.increment(&Sclk::new(0, 1_000));
        assert_eq!(sum.coarse, 11);
        assert_eq!(sum.fine, 464);
    }

    #[test]
    fn linear_correlation() {
        let conv = LinearSclkScetConverter::default();
        let scet = conv.to_scet(&Sclk::new(100, 0)).unwrap();
        assert_eq!(scet, ccsds_epoch() + Duration::from_seconds(100.0));
    }

    #[test]
    fn ccsds_millis() {
        let e = epoch_from_ccsds_millis(1_500);
        assert_eq!(e, ccsds_epoch() + Duration::from_seconds(1.5));
    }
}
