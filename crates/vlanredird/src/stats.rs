//! Counter history and derived rates.
//!
//! Every interface and VLAN entry owns a [`History`]: a bounded ring of raw
//! cumulative [`Sample`]s plus the per-tick delta, the largest delta ever seen,
//! the moving average over the retained window and the chart scale of each
//! display mode.

use serde::Serialize;
use vlanredir_common::VlanCounters;

use crate::types::DisplayMode;

/// Six cumulative counters. VLAN entries only populate the rx half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
}

impl Sample {
    /// Converts the per-VLAN map value. Redirected traffic is what the input
    /// received on that VLAN, so it lands in the rx fields.
    pub fn from_vlan_counters(counters: &VlanCounters) -> Self {
        Sample {
            rx_bytes: counters.bytes,
            rx_packets: counters.packets,
            rx_dropped: counters.dropped,
            ..Default::default()
        }
    }

    fn to_array(self) -> [u64; 6] {
        [
            self.rx_bytes,
            self.rx_packets,
            self.rx_dropped,
            self.tx_bytes,
            self.tx_packets,
            self.tx_dropped,
        ]
    }

    fn from_array(values: [u64; 6]) -> Self {
        let [rx_bytes, rx_packets, rx_dropped, tx_bytes, tx_packets, tx_dropped] = values;
        Sample {
            rx_bytes,
            rx_packets,
            rx_dropped,
            tx_bytes,
            tx_packets,
            tx_dropped,
        }
    }

    fn zip_with(self, other: Sample, f: impl Fn(u64, u64) -> u64) -> Sample {
        let a = self.to_array();
        let b = other.to_array();
        Sample::from_array(std::array::from_fn(|i| f(a[i], b[i])))
    }

    /// Per-field `self - earlier`. A counter that went backwards (reset,
    /// interface re-created) contributes 0.
    pub fn delta_since(&self, earlier: &Sample) -> Sample {
        self.zip_with(*earlier, u64::saturating_sub)
    }

    /// Per-field maximum.
    pub fn max(&self, other: &Sample) -> Sample {
        self.zip_with(*other, u64::max)
    }

    /// Largest field charted in `mode`.
    pub fn peak(&self, mode: DisplayMode) -> u64 {
        match mode {
            DisplayMode::Bytes => self.rx_bytes.max(self.tx_bytes),
            DisplayMode::Packets => self.rx_packets.max(self.tx_packets),
            DisplayMode::Dropped => self.rx_dropped.max(self.tx_dropped),
        }
    }
}

/// Fixed-capacity ring. Appending to a full ring evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    /// Slot the next push writes to.
    head: usize,
    count: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Creates an empty ring. A capacity of 0 is bumped to 1.
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer {
            slots: vec![T::default(); capacity.max(1)],
            head: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        let capacity = self.slots.len();
        self.slots[self.head] = item;
        self.head = (self.head + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Item `back` steps behind the newest one (0 is the newest).
    pub fn nth_latest(&self, back: usize) -> Option<&T> {
        if back >= self.count {
            return None;
        }
        let capacity = self.slots.len();
        Some(&self.slots[(self.head + capacity - 1 - back) % capacity])
    }

    pub fn latest(&self) -> Option<&T> {
        self.nth_latest(0)
    }

    /// Items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.count) % capacity;
        (0..self.count).map(move |i| &self.slots[(start + i) % capacity])
    }
}

/// Position of the highest set bit, 0 for 0.
pub fn highest_set_bit(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        u64::BITS - 1 - value.leading_zeros()
    }
}

/// Right shift that makes the largest delta fit a chart of `range_bits` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChartScale {
    shift: u32,
}

impl ChartScale {
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Recomputes the shift for `max`. Returns true when it changed, in which
    /// case every plotted point must be rescaled rather than appended.
    pub fn update(&mut self, max: u64, range_bits: u32) -> bool {
        let shift = (highest_set_bit(max) + 1).saturating_sub(range_bits);
        let changed = shift != self.shift;
        self.shift = shift;
        changed
    }

    pub fn apply(&self, value: u64) -> u64 {
        value >> self.shift
    }
}

/// Bounded sample history of one entity and everything derived from it.
#[derive(Debug, Clone)]
pub struct History {
    samples: RingBuffer<Sample>,
    diff: Sample,
    diff_max: Sample,
    diff_sma: Option<Sample>,
    scales: [ChartScale; 3],
}

impl History {
    /// History keeping `depth` deltas, i.e. `depth + 1` samples.
    pub fn new(depth: usize) -> Self {
        History {
            samples: RingBuffer::with_capacity(depth.saturating_add(1)),
            diff: Sample::default(),
            diff_max: Sample::default(),
            diff_sma: None,
            scales: [ChartScale::default(); 3],
        }
    }

    /// Appends a sample and recomputes the derived statistics.
    pub fn record(&mut self, sample: Sample) {
        self.samples.push(sample);
        if self.samples.len() < 2 {
            return;
        }

        if let (Some(newest), Some(previous)) =
            (self.samples.nth_latest(0), self.samples.nth_latest(1))
        {
            self.diff = newest.delta_since(previous);
        }

        let mut diff_max = self.diff_max;
        let mut sum = [0f64; 6];
        let mut n = 0usize;
        for delta in self.deltas() {
            diff_max = diff_max.max(&delta);
            for (acc, value) in sum.iter_mut().zip(delta.to_array()) {
                *acc += value as f64;
            }
            n += 1;
        }
        self.diff_max = diff_max;
        self.diff_sma = Some(Sample::from_array(sum.map(|acc| (acc / n as f64) as u64)));
    }

    /// Consecutive deltas of the retained samples, oldest first.
    pub fn deltas(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(earlier, later)| later.delta_since(earlier))
    }

    /// Rescales every display mode from `diff_max`. Returns the modes whose
    /// shift changed.
    pub fn rescale(&mut self, range_bits: u32) -> Vec<DisplayMode> {
        let diff_max = self.diff_max;
        DisplayMode::ALL
            .into_iter()
            .filter(|mode| self.scales[mode.index()].update(diff_max.peak(*mode), range_bits))
            .collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.latest().copied()
    }

    /// Number of retained samples.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Zero until two samples were recorded.
    pub fn diff(&self) -> Sample {
        self.diff
    }

    pub fn diff_max(&self) -> Sample {
        self.diff_max
    }

    /// `None` until two samples were recorded.
    pub fn diff_sma(&self) -> Option<Sample> {
        self.diff_sma
    }

    pub fn scale(&self, mode: DisplayMode) -> ChartScale {
        self.scales[mode.index()]
    }
}

const SIZE_UNITS: [&str; 7] = ["EiB", "PiB", "TiB", "GiB", "MiB", "KiB", "B"];

/// Renders a byte count with binary units: exact values as integers,
/// others with one decimal. Zero renders as `"0"`.
pub fn format_size(size: u64) -> String {
    let mut multiplier: u64 = 1 << 60;
    for unit in SIZE_UNITS {
        if size >= multiplier {
            return if size % multiplier == 0 {
                format!("{} {}", size / multiplier, unit)
            } else {
                format!("{:.1} {}", size as f64 / multiplier as f64, unit)
            };
        }
        multiplier >>= 10;
    }
    "0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rx(bytes: u64) -> Sample {
        Sample {
            rx_bytes: bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_ring_count_saturates() {
        let mut ring = RingBuffer::with_capacity(3);
        assert!(ring.is_empty());
        assert_eq!(ring.latest(), None);
        for k in 1..=5u64 {
            ring.push(k);
            assert_eq!(ring.len(), (k as usize).min(3));
            assert_eq!(ring.latest(), Some(&k));
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = RingBuffer::with_capacity(3);
        for k in 1..=4u64 {
            ring.push(k);
        }
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.nth_latest(2), Some(&2));
        assert_eq!(ring.nth_latest(3), None);
    }

    #[test]
    fn test_ring_zero_capacity() {
        let mut ring = RingBuffer::with_capacity(0);
        ring.push(7u64);
        ring.push(8u64);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.latest(), Some(&8));
    }

    #[test]
    fn test_delta_is_wraparound_safe() {
        let earlier = Sample {
            rx_bytes: 100,
            tx_packets: 50,
            ..Default::default()
        };
        let later = Sample {
            rx_bytes: 40,
            tx_packets: 70,
            ..Default::default()
        };
        let delta = later.delta_since(&earlier);
        assert_eq!(delta.rx_bytes, 0);
        assert_eq!(delta.tx_packets, 20);
    }

    #[test]
    fn test_single_sample_has_no_rates() {
        let mut history = History::new(4);
        history.record(rx(100));
        assert_eq!(history.count(), 1);
        assert_eq!(history.diff(), Sample::default());
        assert_eq!(history.diff_sma(), None);
        assert_eq!(history.latest(), Some(rx(100)));
    }

    #[test]
    fn test_sma_of_two_samples_is_the_delta() {
        let mut history = History::new(4);
        history.record(rx(100));
        history.record(rx(350));
        assert_eq!(history.diff(), rx(250));
        assert_eq!(history.diff_sma(), Some(rx(250)));
    }

    #[test]
    fn test_sma_over_window() {
        let mut history = History::new(2);
        for bytes in [0, 10, 40, 70] {
            history.record(rx(bytes));
        }
        // window holds 10, 40, 70: deltas 30 and 30
        assert_eq!(history.count(), 3);
        assert_eq!(history.diff_sma(), Some(rx(30)));
        assert_eq!(history.diff_max().rx_bytes, 30);
    }

    #[test]
    fn test_diff_max_never_decreases() {
        let mut history = History::new(2);
        let mut previous = 0;
        for bytes in [0, 500, 600, 650, 660, 661] {
            history.record(rx(bytes));
            let max = history.diff_max().rx_bytes;
            assert!(max >= previous);
            previous = max;
        }
        assert_eq!(previous, 500);
    }

    #[test]
    fn test_deltas_follow_window() {
        let mut history = History::new(3);
        for bytes in [5, 10, 20] {
            history.record(rx(bytes));
        }
        let deltas: Vec<u64> = history.deltas().map(|d| d.rx_bytes).collect();
        assert_eq!(deltas, vec![5, 10]);
    }

    #[test]
    fn test_highest_set_bit() {
        assert_eq!(highest_set_bit(0), 0);
        assert_eq!(highest_set_bit(1), 0);
        assert_eq!(highest_set_bit(2), 1);
        assert_eq!(highest_set_bit(255), 7);
        assert_eq!(highest_set_bit(u64::MAX), 63);
    }

    #[test]
    fn test_chart_scale() {
        let mut scale = ChartScale::default();
        assert!(!scale.update(100, 7));
        assert_eq!(scale.shift(), 0);
        assert!(scale.update(1000, 7));
        assert_eq!(scale.shift(), 3);
        assert_eq!(scale.apply(1000), 125);
        assert!(!scale.update(1023, 7));
    }

    #[test]
    fn test_rescale_reports_changed_modes() {
        let mut history = History::new(4);
        history.record(Sample::default());
        history.record(Sample {
            rx_bytes: 4096,
            tx_packets: 10,
            ..Default::default()
        });
        assert_eq!(history.rescale(7), vec![DisplayMode::Bytes]);
        assert_eq!(history.scale(DisplayMode::Bytes).shift(), 6);
        assert!(history.rescale(7).is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0");
        assert_eq!(format_size(1), "1 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1 KiB");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 << 30), "3 GiB");
        assert_eq!(format_size(1 << 60), "1 EiB");
    }
}
