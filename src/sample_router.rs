use crate::export::coerce_field;

/// One parsed record: a wrapping counter followed by the channel readings.
///
/// Fields are kept as received. Numeric coercion happens on export, where a
/// malformed field becomes `NaN` rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    fields: Vec<String>,
}

impl SampleRow {
    /// Build a row from already-split fields. Returns `None` for fewer than two
    /// fields, which are never sample data.
    pub fn from_fields(fields: Vec<String>) -> Option<Self> {
        (fields.len() >= 2).then_some(Self { fields })
    }

    /// Split a delimited record; see [`SampleRow::from_fields`].
    pub fn parse(line: &str) -> Option<Self> {
        Self::from_fields(line.split(',').map(str::to_owned).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of channel values after the counter.
    pub fn channel_count(&self) -> usize {
        self.fields.len() - 1
    }

    /// The sequence counter, if the first field is a valid 0-255 integer.
    pub fn counter(&self) -> Option<u8> {
        self.fields.first().and_then(|f| f.trim().parse().ok())
    }

    /// Every field coerced to a number.
    pub fn numeric_fields(&self) -> impl Iterator<Item = f64> + '_ {
        self.fields.iter().map(|f| coerce_field(f))
    }

    /// The comma-joined record as it came off the wire.
    pub fn to_line(&self) -> String {
        self.fields.join(",")
    }
}

/// Channel layout seen so far. Only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSchema {
    channels: usize,
}

impl ChannelSchema {
    pub fn channels(&self) -> usize {
        self.channels
    }

    fn observe(&mut self, row: &SampleRow) -> bool {
        if row.channel_count() > self.channels {
            self.channels = row.channel_count();
            true
        } else {
            false
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        std::iter::once("Counter".to_string())
            .chain((1..=self.channels).map(|i| format!("Channel {i}")))
            .collect()
    }
}

/// Checks that the wrapping counter advances by one per sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterTracker {
    last: Option<u8>,
    gaps: u64,
    missed: u64,
}

impl CounterTracker {
    /// Record a counter value and return how many samples were skipped before it.
    pub fn observe(&mut self, counter: Option<u8>) -> Option<u8> {
        let Some(counter) = counter else {
            self.last = None;
            return None;
        };

        let skipped = self.last.and_then(|last| {
            let expected = last.wrapping_add(1);
            (counter != expected).then(|| counter.wrapping_sub(expected))
        });
        if let Some(skipped) = skipped {
            log::debug!(
                "Non-sequential counter: expected {}, got {}",
                self.last.map_or(0, |l| l.wrapping_add(1)),
                counter
            );
            self.gaps += 1;
            self.missed += u64::from(skipped);
        }
        self.last = Some(counter);
        skipped
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn missed_samples(&self) -> u64 {
        self.missed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Running counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub lines: u64,
    pub samples: u64,
    pub control_lines: u64,
    pub counter_gaps: u64,
    pub missed_samples: u64,
    pub channels: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    /// Single-field line: a device log or control message.
    Control(String),
    /// Delivered to the live view only.
    Live,
    /// Delivered to the live view and must be appended to the recording buffer.
    Record(SampleRow),
}

#[derive(Debug, Default)]
pub struct SampleRouter {
    schema: ChannelSchema,
    counter: CounterTracker,
    stats: StreamStats,
}

impl SampleRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one line. Sample rows go to `live_view` first; while
    /// `recording` they are also handed back for buffering.
    pub fn route(
        &mut self,
        line: &str,
        recording: bool,
        live_view: impl FnOnce(&SampleRow),
    ) -> RouterOutcome {
        self.stats.lines += 1;

        let Some(row) = SampleRow::parse(line) else {
            self.stats.control_lines += 1;
            return RouterOutcome::Control(line.to_string());
        };

        if self.schema.observe(&row) {
            log::debug!("Channel schema grew to {} channels", self.schema.channels());
        }
        self.counter.observe(row.counter());
        self.stats.samples += 1;
        self.stats.counter_gaps = self.counter.gaps();
        self.stats.missed_samples = self.counter.missed_samples();
        self.stats.channels = self.schema.channels();

        live_view(&row);

        if recording {
            RouterOutcome::Record(row)
        } else {
            RouterOutcome::Live
        }
    }

    pub fn schema(&self) -> ChannelSchema {
        self.schema
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_field_line_is_control() {
        let mut router = SampleRouter::new();
        let mut seen = 0;
        let outcome = router.route("Board ready", true, |_| seen += 1);
        assert_eq!(outcome, RouterOutcome::Control("Board ready".into()));
        assert_eq!(seen, 0);
        assert_eq!(router.stats().control_lines, 1);
        assert_eq!(router.stats().samples, 0);
    }

    #[test]
    fn test_empty_line_is_control() {
        let mut router = SampleRouter::new();
        assert!(matches!(router.route("", true, |_| {}), RouterOutcome::Control(_)));
    }

    #[test]
    fn test_sample_goes_to_live_view_when_idle() {
        let mut router = SampleRouter::new();
        let mut delivered = Vec::new();
        let outcome = router.route("1,10,20,30,40,50,60", false, |row| {
            delivered.push(row.to_line());
        });
        assert_eq!(outcome, RouterOutcome::Live);
        assert_eq!(delivered, vec!["1,10,20,30,40,50,60"]);
    }

    #[test]
    fn test_sample_is_returned_for_buffering_while_recording() {
        let mut router = SampleRouter::new();
        let mut delivered = 0;
        let outcome = router.route("2,11,21", true, |_| delivered += 1);
        assert_eq!(delivered, 1);
        match outcome {
            RouterOutcome::Record(row) => {
                assert_eq!(row.fields(), ["2", "11", "21"]);
                assert_eq!(row.counter(), Some(2));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_malformed_fields_are_not_rejected() {
        let mut router = SampleRouter::new();
        let outcome = router.route("7,abc,", true, |_| {});
        let RouterOutcome::Record(row) = outcome else {
            panic!("expected a sample row");
        };
        let values: Vec<f64> = row.numeric_fields().collect();
        assert_eq!(values[0], 7.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 0.0);
    }

    #[test]
    fn test_schema_is_monotonic() {
        let mut router = SampleRouter::new();
        router.route("1,1,2,3", false, |_| {});
        router.route("2,1", false, |_| {});
        assert_eq!(router.schema().channels(), 3);
        assert_eq!(
            router.schema().column_names(),
            vec!["Counter", "Channel 1", "Channel 2", "Channel 3"]
        );
    }

    #[test]
    fn test_counter_wraps_without_gap() {
        let mut tracker = CounterTracker::default();
        assert_eq!(tracker.observe(Some(254)), None);
        assert_eq!(tracker.observe(Some(255)), None);
        assert_eq!(tracker.observe(Some(0)), None);
        assert_eq!(tracker.gaps(), 0);
    }

    #[test]
    fn test_counter_gap_is_counted() {
        let mut tracker = CounterTracker::default();
        tracker.observe(Some(10));
        assert_eq!(tracker.observe(Some(13)), Some(2));
        assert_eq!(tracker.observe(Some(14)), None);
        assert_eq!(tracker.gaps(), 1);
        assert_eq!(tracker.missed_samples(), 2);
    }

    #[test]
    fn test_unparseable_counter_resets_tracking() {
        let mut tracker = CounterTracker::default();
        tracker.observe(Some(10));
        assert_eq!(tracker.observe(None), None);
        assert_eq!(tracker.observe(Some(40)), None);
        assert_eq!(tracker.gaps(), 0);
    }

    #[test]
    fn test_row_requires_two_fields() {
        assert!(SampleRow::parse("42").is_none());
        assert!(SampleRow::from_fields(vec![]).is_none());
        assert_eq!(SampleRow::parse("1,2").map(|r| r.channel_count()), Some(1));
    }
}
