//! Start-up configuration.
//!
//! Configuration is read once, when a [`HandleManager`](crate::HandleManager)
//! is created, and is immutable afterwards.

use std::thread;

use intentional::Cast;
use kempt::Map;

use crate::handle::Handle;

/// A configuration knob understood by this crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KnobId {
    /// Nonzero enables one handle table per heap.
    ServerGc,
    /// The number of heaps in server mode. Zero picks one per available
    /// processor.
    HeapCount,
    /// The most segments each handle kind may grow to in a single table.
    HandleSegmentLimit,
    /// The number of bucket entries in each segment of the handle table map.
    MapSegmentSize,
}

impl KnobId {
    /// Every knob.
    pub const ALL: [Self; 4] = [
        Self::ServerGc,
        Self::HeapCount,
        Self::HandleSegmentLimit,
        Self::MapSegmentSize,
    ];

    /// Returns the name hosts pass this knob by.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ServerGc => "System.GC.Server",
            Self::HeapCount => "System.GC.HeapCount",
            Self::HandleSegmentLimit => "System.GC.HandleSegmentLimit",
            Self::MapSegmentSize => "System.GC.HandleMapSegmentSize",
        }
    }

    /// Returns the name of the environment variable that overrides this
    /// knob.
    #[must_use]
    pub const fn legacy_name(self) -> &'static str {
        match self {
            Self::ServerGc => "TETHER_gcServer",
            Self::HeapCount => "TETHER_GCHeapCount",
            Self::HandleSegmentLimit => "TETHER_GCHandleSegmentLimit",
            Self::MapSegmentSize => "TETHER_GCHandleMapSegmentSize",
        }
    }

    /// Looks up a knob by [`name()`](Self::name).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|knob| knob.name() == name)
    }
}

/// A resolved snapshot of knob values.
#[derive(Clone, Debug, Default)]
pub struct Knobs {
    values: Map<KnobId, u32>,
}

impl Knobs {
    /// Resolves knobs from host-provided `(name, value)` pairs.
    ///
    /// `legacy` looks up a [`KnobId::legacy_name()`]. A legacy value that is
    /// present always takes precedence over a value passed by name. Names
    /// that aren't recognized are ignored.
    pub fn resolve<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        legacy: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut named = Map::new();
        for (name, value) in pairs {
            match KnobId::from_name(name) {
                Some(knob) => {
                    named.insert(knob, parse_dword(value));
                }
                None => tracing::debug!(name, "ignoring unknown configuration knob"),
            }
        }

        let mut values = Map::new();
        for knob in KnobId::ALL {
            let legacy = legacy(knob.legacy_name()).map(|value| parse_dword(&value));
            if let Some(value) = legacy.or_else(|| named.get(&knob).copied()) {
                values.insert(knob, value);
            }
        }
        Self { values }
    }

    /// Resolves knobs using only the legacy environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve([], |name| std::env::var(name).ok())
    }

    /// Returns the value of `knob`, if it was configured.
    #[must_use]
    pub fn dword(&self, knob: KnobId) -> Option<u32> {
        self.values.get(&knob).copied()
    }

    /// Returns the value of `knob` interpreted as a flag.
    #[must_use]
    pub fn flag(&self, knob: KnobId) -> Option<bool> {
        self.dword(knob).map(|value| value != 0)
    }
}

/// Parses an unsigned integer the way `strtoul` does with a base of zero: a
/// `0x` prefix selects hexadecimal, a leading `0` selects octal, and parsing
/// stops at the first character that isn't a digit. Returns 0 if no digits
/// were found.
fn parse_dword(value: &str) -> u32 {
    let value = value.trim_start();
    let value = value.strip_prefix('+').unwrap_or(value);
    let (radix, digits) = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .filter(|hex| hex.starts_with(|c: char| c.is_ascii_hexdigit()))
    {
        (16, hex)
    } else if value.len() > 1 && value.starts_with('0') {
        (8, &value[1..])
    } else {
        (10, value)
    };

    let mut result = 0_u32;
    for digit in digits.chars().map_while(|c| c.to_digit(radix)) {
        result = match result
            .checked_mul(radix)
            .and_then(|result| result.checked_add(digit))
        {
            Some(result) => result,
            None => return u32::MAX,
        };
    }
    result
}

/// Settings for a [`HandleManager`](crate::HandleManager).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandleTableConfig {
    /// When true, every bucket has one table per heap.
    pub server_gc: bool,
    /// The number of heaps. Always 1 when `server_gc` is false.
    pub heap_count: usize,
    /// The number of bucket entries in each segment of the handle table map.
    pub initial_map_size: usize,
    /// The most segments each handle kind may grow to in a single table.
    pub max_segments_per_store: usize,
}

impl HandleTableConfig {
    /// The default number of entries in each map segment.
    pub const DEFAULT_MAP_SIZE: usize = 10;
    /// The default segment limit, which is the most a [`Handle`] can address.
    pub const DEFAULT_MAX_SEGMENTS: usize = Handle::SEGMENT_LIMIT as usize;

    /// Returns a workstation configuration with a single heap.
    #[must_use]
    pub const fn workstation() -> Self {
        Self {
            server_gc: false,
            heap_count: 1,
            initial_map_size: Self::DEFAULT_MAP_SIZE,
            max_segments_per_store: Self::DEFAULT_MAX_SEGMENTS,
        }
    }

    /// Returns a server configuration with `heap_count` heaps.
    #[must_use]
    pub fn server(heap_count: usize) -> Self {
        Self {
            server_gc: true,
            heap_count: heap_count.max(1),
            ..Self::workstation()
        }
    }

    /// Builds a configuration from resolved knobs, using defaults for
    /// anything that wasn't configured.
    #[must_use]
    pub fn from_knobs(knobs: &Knobs) -> Self {
        let mut config = if knobs.flag(KnobId::ServerGc).unwrap_or(false) {
            let heaps = match knobs.dword(KnobId::HeapCount) {
                Some(heaps) if heaps > 0 => heaps.cast::<usize>(),
                _ => thread::available_parallelism().map_or(1, usize::from),
            };
            Self::server(heaps)
        } else {
            Self::workstation()
        };
        if let Some(limit) = knobs.dword(KnobId::HandleSegmentLimit).filter(|limit| *limit > 0) {
            config.max_segments_per_store = limit.cast::<usize>().min(Self::DEFAULT_MAX_SEGMENTS);
        }
        if let Some(size) = knobs.dword(KnobId::MapSegmentSize).filter(|size| *size > 0) {
            config.initial_map_size = size.cast::<usize>();
        }
        config
    }
}

impl Default for HandleTableConfig {
    fn default() -> Self {
        Self::workstation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_legacy(_name: &str) -> Option<String> {
        None
    }

    #[test]
    fn dword_parsing() {
        assert_eq!(parse_dword("42"), 42);
        assert_eq!(parse_dword("0x1F"), 31);
        assert_eq!(parse_dword("0X1f"), 31);
        assert_eq!(parse_dword("017"), 15);
        assert_eq!(parse_dword("0"), 0);
        assert_eq!(parse_dword("  12abc"), 12);
        assert_eq!(parse_dword("abc"), 0);
        assert_eq!(parse_dword("0x"), 0);
        assert_eq!(parse_dword("99999999999"), u32::MAX);
    }

    #[test]
    fn legacy_value_wins() {
        let knobs = Knobs::resolve([("System.GC.Server", "0")], |name| {
            (name == "TETHER_gcServer").then(|| String::from("1"))
        });
        assert_eq!(knobs.flag(KnobId::ServerGc), Some(true));
    }

    #[test]
    fn named_values_are_used_without_legacy() {
        let knobs = Knobs::resolve(
            [
                ("System.GC.Server", "1"),
                ("System.GC.HeapCount", "0x4"),
                ("System.Unknown", "7"),
            ],
            no_legacy,
        );
        assert_eq!(knobs.flag(KnobId::ServerGc), Some(true));
        assert_eq!(knobs.dword(KnobId::HeapCount), Some(4));
        assert_eq!(knobs.dword(KnobId::HandleSegmentLimit), None);
    }

    #[test]
    fn legacy_values_apply_when_not_named() {
        let knobs = Knobs::resolve([], |name| {
            (name == "TETHER_GCHandleSegmentLimit").then(|| String::from("8"))
        });
        assert_eq!(knobs.dword(KnobId::HandleSegmentLimit), Some(8));
    }

    #[test]
    fn config_from_knobs() {
        let config = HandleTableConfig::from_knobs(&Knobs::default());
        assert_eq!(config, HandleTableConfig::workstation());

        let knobs = Knobs::resolve(
            [
                ("System.GC.Server", "1"),
                ("System.GC.HeapCount", "3"),
                ("System.GC.HandleSegmentLimit", "2"),
                ("System.GC.HandleMapSegmentSize", "4"),
            ],
            no_legacy,
        );
        let config = HandleTableConfig::from_knobs(&knobs);
        assert!(config.server_gc);
        assert_eq!(config.heap_count, 3);
        assert_eq!(config.max_segments_per_store, 2);
        assert_eq!(config.initial_map_size, 4);
    }

    #[test]
    fn heap_count_ignored_for_workstation() {
        let knobs = Knobs::resolve([("System.GC.HeapCount", "8")], no_legacy);
        assert_eq!(HandleTableConfig::from_knobs(&knobs).heap_count, 1);
    }
}
