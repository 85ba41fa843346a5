//! Core data types shared across the planner, the stores, and the transfer
//! engine: [`Volume`], [`Diff`], and the process-local [`KnownSizes`] table.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// An immutable, read-only copy-on-write snapshot.
///
/// Two volumes are equal iff their `uuid`s are equal; `uuid` is the hash key
/// used throughout the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Volume {
    pub uuid: Uuid,
    /// Monotonic transaction id at snapshot creation time.
    pub gen: u64,
    pub total_size: Option<u64>,
    pub exclusive_size: Option<u64>,
    /// Human-readable path, for display only; never used for equality.
    pub path: Option<String>,
}

impl Volume {
    pub fn new(uuid: Uuid, gen: u64) -> Self {
        Volume {
            uuid,
            gen,
            total_size: None,
            exclusive_size: None,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_sizes(mut self, total: Option<u64>, exclusive: Option<u64>) -> Self {
        self.total_size = total;
        self.exclusive_size = exclusive;
        self
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match (self.total_size, self.exclusive_size) {
            (Some(t), Some(e)) => format!(
                "{}, {} exclusive",
                crate::humanize::humanize(t),
                crate::humanize::humanize(e)
            ),
            (None, Some(e)) => format!("{} exclusive", crate::humanize::humanize(e)),
            _ => "size unknown".to_string(),
        };
        write!(
            f,
            "{} {} ({})",
            self.path.as_deref().unwrap_or("?"),
            crate::humanize::print_uuid(&self.uuid),
            size
        )
    }
}

/// Identifies which backend holds a given [`Diff`]. The planner carries
/// stores in a `Vec`; a `Diff` references one by index rather than by
/// borrowed reference, so nodes can outlive any single relaxation pass.
pub type SinkId = usize;

/// A directed edge from `from` (`None` meaning "full snapshot") to `to`,
/// backed by a specific store.
#[derive(Debug, Clone)]
pub struct Diff {
    pub to: Uuid,
    pub from: Option<Uuid>,
    pub size: u64,
    pub size_is_estimated: bool,
    pub sink: SinkId,
}

impl Diff {
    pub fn new(to: Uuid, from: Option<Uuid>, size: u64, size_is_estimated: bool, sink: SinkId) -> Self {
        Diff {
            to,
            from,
            size,
            size_is_estimated,
            sink,
        }
    }

    /// Bytes to move if this edge is accepted, adjusted for planning bias
    /// toward edges that will later be measured precisely.
    ///
    /// Mirrors the `edge_size_adjusted` multiplier in the planner's
    /// relaxation step (1.2x when a measurement pass will run, 2x if not).
    pub fn adjusted_size(&self, will_measure: bool) -> f64 {
        if !self.size_is_estimated {
            return self.size as f64;
        }
        self.size as f64 * if will_measure { 1.2 } else { 2.0 }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "{} from {} ({}) via sink#{}",
                crate::humanize::print_uuid(&self.to),
                crate::humanize::print_uuid(&from),
                crate::humanize::humanize(self.size),
                self.sink
            ),
            None => write!(
                f,
                "{} from <none> ({}) via sink#{}",
                crate::humanize::print_uuid(&self.to),
                crate::humanize::humanize(self.size),
                self.sink
            ),
        }
    }
}

/// A process-local mapping `(to, from) -> exact_size_in_bytes`, seeded from
/// destination sidecar files and updated as estimated edges are measured.
///
/// Held as an explicit object threaded through callers rather than a
/// process-wide global, per the design note on the original's global table.
#[derive(Debug, Default, Clone)]
pub struct KnownSizes {
    sizes: HashMap<(Uuid, Option<Uuid>), u64>,
}

impl KnownSizes {
    pub fn new() -> Self {
        KnownSizes::default()
    }

    pub fn get(&self, to: Uuid, from: Option<Uuid>) -> Option<u64> {
        self.sizes.get(&(to, from)).copied()
    }

    pub fn record(&mut self, to: Uuid, from: Option<Uuid>, size: u64) {
        self.sizes.insert((to, from), size);
    }

    /// Parses sidecar lines of the form `<to>\t<from>\t<size>`. `from` may be
    /// the literal string `-` to mean "no parent". Malformed lines are
    /// skipped, never raised (property 6 / 9 in the testable-properties
    /// list: tolerant round-tripping).
    pub fn load_sidecar(&mut self, text: &str) {
        for line in text.lines() {
            let mut fields = line.split('\t');
            let (Some(to), Some(from), Some(size)) = (fields.next(), fields.next(), fields.next()) else {
                continue;
            };
            let Ok(to) = Uuid::parse_str(to) else { continue };
            let from = if from == "-" {
                None
            } else {
                match Uuid::parse_str(from) {
                    Ok(u) => Some(u),
                    Err(_) => continue,
                }
            };
            let Ok(size) = size.trim().parse::<u64>() else { continue };
            self.record(to, from, size);
        }
    }

    /// Renders the table back to sidecar text, one line per known size.
    pub fn to_sidecar(&self) -> String {
        let mut out = String::new();
        for ((to, from), size) in &self.sizes {
            let from_str = from.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("{to}\t{from_str}\t{size}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn volume_equality_is_by_uuid_only() {
        let a = Volume::new(uuid(1), 5).with_path("a");
        let b = Volume::new(uuid(1), 999).with_path("b");
        assert_eq!(a, b);
    }

    #[test]
    fn adjusted_size_unchanged_when_known() {
        let d = Diff::new(uuid(1), None, 1000, false, 0);
        assert_eq!(d.adjusted_size(true), 1000.0);
        assert_eq!(d.adjusted_size(false), 1000.0);
    }

    #[test]
    fn adjusted_size_biases_estimated_edges() {
        let d = Diff::new(uuid(1), None, 1000, true, 0);
        assert_eq!(d.adjusted_size(true), 1200.0);
        assert_eq!(d.adjusted_size(false), 2000.0);
    }

    #[test]
    fn known_sizes_round_trip() {
        let mut table = KnownSizes::new();
        table.record(uuid(1), Some(uuid(2)), 12345);
        table.record(uuid(3), None, 99);
        let text = table.to_sidecar();

        let mut loaded = KnownSizes::new();
        loaded.load_sidecar(&text);
        assert_eq!(loaded.get(uuid(1), Some(uuid(2))), Some(12345));
        assert_eq!(loaded.get(uuid(3), None), Some(99));
    }

    #[test]
    fn known_sizes_tolerates_malformed_lines() {
        let mut table = KnownSizes::new();
        table.load_sidecar("not-a-valid-line\n\nfoo\tbar\tbaz\n");
        assert_eq!(table.sizes.len(), 0);
    }

    #[test]
    fn diff_display_has_no_from() {
        let d = Diff::new(uuid(7), None, 42, false, 1);
        let s = d.to_string();
        assert!(s.contains("<none>"));
    }
}
