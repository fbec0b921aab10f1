use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ScheduleError;

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const MAX_SLOT_DURATION_HOURS: u8 = 4;

/// Day keys as the inverter firmware spells them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Weekday {
    Mon,
    Tus,
    Wen,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tus,
        Weekday::Wen,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Mon => "Mon",
            Weekday::Tus => "Tus",
            Weekday::Wen => "Wen",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        }
    }

    /// Position in the Monday-first week, 0..=6.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weekday {
    type Err = ScheduleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let day = match value.trim().to_ascii_lowercase().as_str() {
            "mon" | "monday" => Weekday::Mon,
            "tus" | "tue" | "tues" | "tuesday" => Weekday::Tus,
            "wen" | "wed" | "wednesday" => Weekday::Wen,
            "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
            "fri" | "friday" => Weekday::Fri,
            "sat" | "saturday" => Weekday::Sat,
            "sun" | "sunday" => Weekday::Sun,
            _ => return Err(ScheduleError::UnknownDay(value.to_string())),
        };
        Ok(day)
    }
}

impl TryFrom<String> for Weekday {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Weekday> for &'static str {
    fn from(day: Weekday) -> Self {
        day.as_str()
    }
}

/// Target of a clear operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DaySelector {
    All,
    Day(Weekday),
}

impl DaySelector {
    pub fn days(self) -> Vec<Weekday> {
        match self {
            DaySelector::All => Weekday::ALL.to_vec(),
            DaySelector::Day(day) => vec![day],
        }
    }
}

impl FromStr for DaySelector {
    type Err = ScheduleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(DaySelector::All);
        }
        value.parse().map(DaySelector::Day)
    }
}

impl TryFrom<String> for DaySelector {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DaySelector> for String {
    fn from(selector: DaySelector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for DaySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaySelector::All => f.write_str("all"),
            DaySelector::Day(day) => f.write_str(day.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    Charge,
    Discharge,
}

impl SlotMode {
    pub fn code(self) -> u8 {
        match self {
            SlotMode::Charge => 1,
            SlotMode::Discharge => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SlotMode::Charge),
            2 => Some(SlotMode::Discharge),
            _ => None,
        }
    }
}

impl fmt::Display for SlotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotMode::Charge => f.write_str("charge"),
            SlotMode::Discharge => f.write_str("discharge"),
        }
    }
}

impl FromStr for SlotMode {
    type Err = ScheduleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "charge" => Ok(SlotMode::Charge),
            "discharge" => Ok(SlotMode::Discharge),
            _ => Err(ScheduleError::UnknownMode(value.to_string())),
        }
    }
}

/// One charge or discharge window. Construct through [`ScheduleSlot::new`] so the
/// firmware limits hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScheduleSlot {
    start_hour: u8,
    start_minute: u8,
    duration: u8,
    mode: SlotMode,
}

impl ScheduleSlot {
    pub fn new(
        start_hour: u8,
        start_minute: u8,
        duration: u8,
        mode: SlotMode,
    ) -> Result<Self, ScheduleError> {
        if start_hour > 23 {
            return Err(ScheduleError::InvalidHour(start_hour));
        }
        if start_minute != 0 && start_minute != 30 {
            return Err(ScheduleError::InvalidMinute(start_minute));
        }
        if !(1..=MAX_SLOT_DURATION_HOURS).contains(&duration) {
            return Err(ScheduleError::InvalidDuration(duration));
        }

        let slot = Self {
            start_hour,
            start_minute,
            duration,
            mode,
        };
        if slot.end_minutes() > MINUTES_PER_DAY {
            return Err(ScheduleError::CrossesMidnight(slot.to_string()));
        }
        Ok(slot)
    }

    pub fn start_hour(&self) -> u8 {
        self.start_hour
    }

    pub fn start_minute(&self) -> u8 {
        self.start_minute
    }

    pub fn duration(&self) -> u8 {
        self.duration
    }

    pub fn mode(&self) -> SlotMode {
        self.mode
    }

    pub fn start_minutes(&self) -> u16 {
        u16::from(self.start_hour) * 60 + u16::from(self.start_minute)
    }

    pub fn end_minutes(&self) -> u16 {
        self.start_minutes() + u16::from(self.duration) * 60
    }

    /// Half-open interval overlap; back-to-back slots do not overlap.
    pub fn overlaps(&self, other: &ScheduleSlot) -> bool {
        self.start_minutes() < other.end_minutes() && other.start_minutes() < self.end_minutes()
    }

    /// Packs the slot as `hour << 24 | minute << 16 | duration << 8 | mode`.
    pub fn encode(&self) -> u32 {
        (u32::from(self.start_hour) << 24)
            | (u32::from(self.start_minute) << 16)
            | (u32::from(self.duration) << 8)
            | u32::from(self.mode.code())
    }

    /// Inverse of [`ScheduleSlot::encode`]; `0` is an empty slot.
    pub fn decode(raw: u32) -> Result<Option<Self>, ScheduleError> {
        if raw == 0 {
            return Ok(None);
        }
        let [hour, minute, duration, mode] = raw.to_be_bytes();
        let mode = SlotMode::from_code(mode).ok_or(ScheduleError::InvalidSlotWord(raw))?;
        Self::new(hour, minute, duration, mode)
            .map(Some)
            .map_err(|_| ScheduleError::InvalidSlotWord(raw))
    }
}

impl fmt::Display for ScheduleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.end_minutes();
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02} {}",
            self.start_hour,
            self.start_minute,
            end / 60,
            end % 60,
            self.mode
        )
    }
}
