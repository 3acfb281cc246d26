#![forbid(unsafe_code)]

use crate::error::FilterError;
use std::sync::Mutex;

pub mod names {
    pub const FRAG_TTL_SECS: &str = "frag_ttl_secs";
    pub const FRAG_CAPACITY: &str = "frag_capacity";
    pub const FRAG_SHARDS: &str = "frag_shards";
    pub const STATE_MAX: &str = "state_max";
    pub const LOG_VERDICTS: &str = "log_verdicts";
    pub const DEFAULT_PASS: &str = "default_pass";
}

pub const DEFAULT_FRAG_TTL_SECS: u32 = 30;
pub const DEFAULT_FRAG_CAPACITY: u32 = 256;
pub const DEFAULT_FRAG_SHARDS: u16 = 8;
pub const DEFAULT_STATE_MAX: u32 = 4096;

/// Current value of a knob, tagged with its storage width. `set` keeps the
/// width and only replaces the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl TunableValue {
    pub fn widen(self) -> u64 {
        match self {
            TunableValue::U8(v) => v as u64,
            TunableValue::U16(v) => v as u64,
            TunableValue::U32(v) => v as u64,
            TunableValue::U64(v) => v,
        }
    }

    /// Callers bound `raw` by the tunable's `[min, max]` first, and a
    /// registered `max` always fits the storage width.
    pub fn with_raw(self, raw: u64) -> TunableValue {
        match self {
            TunableValue::U8(_) => TunableValue::U8(raw as u8),
            TunableValue::U16(_) => TunableValue::U16(raw as u16),
            TunableValue::U32(_) => TunableValue::U32(raw as u32),
            TunableValue::U64(_) => TunableValue::U64(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunable {
    pub name: &'static str,
    pub min: u64,
    pub max: u64,
    pub value: TunableValue,
}

impl Tunable {
    pub fn new(name: &'static str, min: u64, max: u64, value: TunableValue) -> Self {
        Tunable {
            name,
            min,
            max,
            value,
        }
    }

    /// A knob that is reported but cannot move after startup.
    pub fn fixed(name: &'static str, value: TunableValue) -> Self {
        let raw = value.widen();
        Tunable::new(name, raw, raw, value)
    }
}

/// Named runtime knobs behind one lock. Listing order is registration
/// order.
#[derive(Debug, Default)]
pub struct TunableTable {
    entries: Mutex<Vec<Tunable>>,
}

impl TunableTable {
    pub fn new() -> Self {
        TunableTable::default()
    }

    /// The engine's knob set with stock values.
    pub fn with_defaults() -> Self {
        TunableTable::for_engine(
            DEFAULT_FRAG_TTL_SECS,
            DEFAULT_FRAG_CAPACITY,
            DEFAULT_FRAG_SHARDS,
            DEFAULT_STATE_MAX,
            false,
            false,
        )
    }

    /// The engine's knob set seeded from its configuration. Out-of-range
    /// seeds clamp to the knob bounds.
    pub fn for_engine(
        frag_ttl_secs: u32,
        frag_capacity: u32,
        frag_shards: u16,
        state_max: u32,
        log_verdicts: bool,
        default_pass: bool,
    ) -> Self {
        let mut table = TunableTable::new();
        table.register(Tunable::new(
            names::FRAG_TTL_SECS,
            1,
            86400,
            TunableValue::U32(frag_ttl_secs.clamp(1, 86400)),
        ));
        table.register(Tunable::new(
            names::FRAG_CAPACITY,
            1,
            65536,
            TunableValue::U32(frag_capacity.clamp(1, 65536)),
        ));
        table.register(Tunable::fixed(
            names::FRAG_SHARDS,
            TunableValue::U16(frag_shards.max(1)),
        ));
        table.register(Tunable::new(
            names::STATE_MAX,
            1,
            1048576,
            TunableValue::U32(state_max.clamp(1, 1048576)),
        ));
        table.register(Tunable::new(
            names::LOG_VERDICTS,
            0,
            1,
            TunableValue::U8(log_verdicts as u8),
        ));
        table.register(Tunable::new(
            names::DEFAULT_PASS,
            0,
            1,
            TunableValue::U8(default_pass as u8),
        ));
        table
    }

    /// Re-registering a name replaces the entry without moving it in the
    /// listing order.
    pub fn register(&mut self, tunable: Tunable) {
        let entries = match self.entries.get_mut() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = entries.iter_mut().find(|t| t.name == tunable.name) {
            *existing = tunable;
        } else {
            entries.push(tunable);
        }
    }

    pub fn get(&self, name: &str) -> Result<Tunable, FilterError> {
        let entries = self.lock();
        entries
            .iter()
            .find(|t| t.name == name)
            .copied()
            .ok_or_else(|| FilterError::UnknownTunable(name.to_string()))
    }

    /// Bounds-checked store; a rejected value leaves the knob untouched.
    pub fn set(&self, name: &str, raw: u64) -> Result<(), FilterError> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| FilterError::UnknownTunable(name.to_string()))?;
        if raw < entry.min || raw > entry.max {
            return Err(FilterError::OutOfRange {
                name: entry.name,
                value: raw,
                min: entry.min,
                max: entry.max,
            });
        }
        entry.value = entry.value.with_raw(raw);
        Ok(())
    }

    pub fn format_all(&self) -> String {
        let entries = self.lock();
        entries.iter().map(format_tunable).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Tunable>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One listing line in the legacy layout. Hex fields follow C `%#lx`,
/// where zero prints as `0` with no `0x` prefix.
pub fn format_tunable(tunable: &Tunable) -> String {
    format!(
        "{}\tmin {}\tmax {}\tcurrent {}\n",
        tunable.name,
        hx(tunable.min),
        hx(tunable.max),
        tunable.value.widen()
    )
}

fn hx(value: u64) -> String {
    if value == 0 {
        String::from("0")
    } else {
        format!("{value:#x}")
    }
}
