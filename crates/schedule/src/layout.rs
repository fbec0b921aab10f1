use tracing::debug;

use crate::{BatterySchedule, ScheduleError, ScheduleSlot, Weekday, MAX_SLOTS_PER_DAY};

pub const DEFAULT_BASE_REGISTER: u16 = 41_601;
/// Six 32-bit slot words per day.
pub const DAY_REGISTERS: u16 = (MAX_SLOTS_PER_DAY as u16) * 2;
/// Seven days followed by Pin and Pout.
pub const BLOCK_REGISTERS: u16 = 7 * DAY_REGISTERS + 2;

/// Where a battery keeps its schedule in the holding-register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleLayout {
    /// Absolute holding register address of Monday's first slot.
    pub base_register: u16,
}

impl Default for ScheduleLayout {
    fn default() -> Self {
        Self {
            base_register: DEFAULT_BASE_REGISTER,
        }
    }
}

impl ScheduleLayout {
    pub fn new(base_register: u16) -> Result<Self, ScheduleError> {
        let last = u32::from(base_register) + u32::from(BLOCK_REGISTERS) - 1;
        if last > u32::from(u16::MAX) {
            return Err(ScheduleError::BlockOverflow {
                base: base_register,
            });
        }
        Ok(Self { base_register })
    }

    pub fn pin_register(&self) -> u16 {
        self.base_register + 7 * DAY_REGISTERS
    }

    pub fn pout_register(&self) -> u16 {
        self.pin_register() + 1
    }

    pub fn encode(&self, schedule: &BatterySchedule) -> Vec<u16> {
        let mut words = Vec::with_capacity(usize::from(BLOCK_REGISTERS));
        for day in Weekday::ALL {
            let slots = schedule.slots(day);
            for index in 0..MAX_SLOTS_PER_DAY {
                let raw = slots.get(index).map(ScheduleSlot::encode).unwrap_or(0);
                words.push((raw >> 16) as u16);
                words.push(raw as u16);
            }
        }
        words.push(schedule.pin);
        words.push(schedule.pout);
        words
    }

    pub fn decode(&self, words: &[u16]) -> Result<BatterySchedule, ScheduleError> {
        let expected = usize::from(BLOCK_REGISTERS);
        if words.len() < expected {
            return Err(ScheduleError::BlockTooShort {
                expected,
                actual: words.len(),
            });
        }

        let mut schedule = BatterySchedule::new();
        let day_words = usize::from(DAY_REGISTERS);
        for (day, chunk) in Weekday::ALL
            .into_iter()
            .zip(words[..7 * day_words].chunks_exact(day_words))
        {
            for pair in chunk.chunks_exact(2) {
                let raw = (u32::from(pair[0]) << 16) | u32::from(pair[1]);
                if let Some(slot) = ScheduleSlot::decode(raw)? {
                    schedule.add_slot(day, slot)?;
                }
            }
        }
        schedule.pin = words[7 * day_words];
        schedule.pout = words[7 * day_words + 1];

        debug!(
            base_register = self.base_register,
            slots = schedule.slot_count(),
            "decoded schedule block"
        );
        Ok(schedule)
    }
}
