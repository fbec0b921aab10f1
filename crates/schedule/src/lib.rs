//! Battery charge/discharge schedule model and its holding-register layout.

mod layout;
mod slot;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

pub use layout::{ScheduleLayout, BLOCK_REGISTERS, DAY_REGISTERS, DEFAULT_BASE_REGISTER};
pub use slot::{
    DaySelector, ScheduleSlot, SlotMode, Weekday, MAX_SLOT_DURATION_HOURS, MINUTES_PER_DAY,
};

pub const MAX_SLOTS_PER_DAY: usize = 6;
pub const DEFAULT_POWER_LIMIT_W: u16 = 5_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown day {0:?}")]
    UnknownDay(String),
    #[error("unknown slot mode {0:?}")]
    UnknownMode(String),
    #[error("start hour {0} must be between 0 and 23")]
    InvalidHour(u8),
    #[error("start minute {0} must be 0 or 30")]
    InvalidMinute(u8),
    #[error("duration {0} must be between 1 and 4 hours")]
    InvalidDuration(u8),
    #[error("slot {0} crosses midnight")]
    CrossesMidnight(String),
    #[error("{day} already holds the maximum of {max} slots")]
    TooManySlots { day: Weekday, max: usize },
    #[error("slot {second} overlaps {first} on {day}")]
    Overlap {
        day: Weekday,
        first: String,
        second: String,
    },
    #[error("invalid packed slot word {0:#010x}")]
    InvalidSlotWord(u32),
    #[error("schedule block needs {expected} registers, got {actual}")]
    BlockTooShort { expected: usize, actual: usize },
    #[error("schedule block at register {base} does not fit in the address space")]
    BlockOverflow { base: u16 },
}

/// Checks that a day's slots fit the firmware limits.
pub fn validate_slots(day: Weekday, slots: &[ScheduleSlot]) -> Result<(), ScheduleError> {
    if slots.len() > MAX_SLOTS_PER_DAY {
        return Err(ScheduleError::TooManySlots {
            day,
            max: MAX_SLOTS_PER_DAY,
        });
    }

    let mut ordered = slots.to_vec();
    ordered.sort_by_key(ScheduleSlot::start_minutes);
    for pair in ordered.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(ScheduleError::Overlap {
                day,
                first: pair[0].to_string(),
                second: pair[1].to_string(),
            });
        }
    }
    Ok(())
}

/// Weekly schedule of one battery plus its charge (`pin`) and discharge (`pout`)
/// power limits in watts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatterySchedule {
    days: BTreeMap<Weekday, Vec<ScheduleSlot>>,
    pub pin: u16,
    pub pout: u16,
}

impl Default for BatterySchedule {
    fn default() -> Self {
        Self {
            days: Weekday::ALL.iter().map(|day| (*day, Vec::new())).collect(),
            pin: DEFAULT_POWER_LIMIT_W,
            pout: DEFAULT_POWER_LIMIT_W,
        }
    }
}

impl BatterySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots of `day`, ordered by start time.
    pub fn slots(&self, day: Weekday) -> &[ScheduleSlot] {
        self.days.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_slot(&mut self, day: Weekday, slot: ScheduleSlot) -> Result<(), ScheduleError> {
        let slots = self.days.entry(day).or_default();
        if slots.len() >= MAX_SLOTS_PER_DAY {
            return Err(ScheduleError::TooManySlots {
                day,
                max: MAX_SLOTS_PER_DAY,
            });
        }

        let mut candidate = slots.clone();
        candidate.push(slot);
        validate_slots(day, &candidate)?;
        candidate.sort_by_key(ScheduleSlot::start_minutes);
        *slots = candidate;
        Ok(())
    }

    /// Empties the selected days. Power limits are left alone.
    pub fn clear(&mut self, selector: DaySelector) {
        for day in selector.days() {
            self.days.entry(day).or_default().clear();
        }
    }

    pub fn set_power(&mut self, pin: Option<u16>, pout: Option<u16>) {
        if let Some(pin) = pin {
            self.pin = pin;
        }
        if let Some(pout) = pout {
            self.pout = pout;
        }
    }

    pub fn slot_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_configured(&self) -> bool {
        self.slot_count() > 0
    }

    /// Per-day rendering such as `"08:00-10:00 charge"`.
    pub fn formatted(&self) -> BTreeMap<Weekday, Vec<String>> {
        self.days
            .iter()
            .map(|(day, slots)| (*day, slots.iter().map(ToString::to_string).collect()))
            .collect()
    }
}
