//! Actions the control service exposes, shared by the HTTP API and the CLI.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use journal::{CommandRecord, JournalEntry, JournalError, JournalStore, Outcome};
use modbus_client::{ClientError, ModbusClient};
use rtu_codec::{
    decode_value, encode_write, register_offset, write_multiple_registers_frame, CodecError,
};
use schedule::{
    BatterySchedule, DaySelector, ScheduleError, ScheduleLayout, ScheduleSlot, SlotMode, Weekday,
    BLOCK_REGISTERS,
};
use types::{DataType, DeviceIdentity, RegisterKind, RegisterValue};

use crate::config::ControlConfig;

pub const WRITE_REGISTER_ACTION: &str = "modbus_write_single_holding_register";
pub const READ_REGISTER_ACTION: &str = "modbus_read_register";
pub const SET_SCHEDULE_SLOT_ACTION: &str = "set_schedule_slot";
pub const CLEAR_SCHEDULE_ACTION: &str = "clear_schedule";
pub const SET_SCHEDULE_POWER_ACTION: &str = "set_schedule_power";

const COMMANDS_METRIC: &str = "solplanet_commands_total";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("unknown battery {0:?}")]
    UnknownBattery(String),
    #[error("device error: {0}")]
    Device(#[from] ClientError),
    #[error("device returned an unreadable schedule: {0}")]
    CorruptSchedule(ScheduleError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("command journal is disabled")]
    JournalDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRegisterRequest {
    pub device_address: i64,
    pub register_address: i64,
    pub data_type: DataType,
    pub value: i64,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteRegisterResponse {
    pub device_address: u8,
    pub register_address: u16,
    pub data_type: DataType,
    pub words: Vec<u16>,
    pub frame: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRegisterRequest {
    pub device_address: i64,
    pub register_address: i64,
    pub data_type: DataType,
    #[serde(default)]
    pub kind: RegisterKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadRegisterResponse {
    pub device_address: u8,
    pub register_address: u16,
    pub data_type: DataType,
    pub kind: RegisterKind,
    pub words: Vec<u16>,
    /// `None` when the device reports the type's "no value" sentinel.
    pub value: Option<RegisterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetScheduleSlotRequest {
    pub battery: String,
    pub day: Weekday,
    pub start_hour: i64,
    pub start_minute: i64,
    pub duration: i64,
    pub mode: SlotMode,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearScheduleRequest {
    pub battery: String,
    pub day: DaySelector,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetSchedulePowerRequest {
    pub battery: String,
    #[serde(default)]
    pub pin: Option<i64>,
    #[serde(default)]
    pub pout: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub battery: String,
    pub device_address: u8,
    pub configured: bool,
    pub schedule: BatterySchedule,
    pub formatted: BTreeMap<Weekday, Vec<String>>,
    /// Write frame for edits; absent when the schedule was only read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub dry_run: bool,
}

impl ScheduleResponse {
    fn new(battery: &DeviceIdentity, schedule: BatterySchedule) -> Self {
        Self {
            battery: battery.isn.clone(),
            device_address: battery.device_address,
            configured: schedule.is_configured(),
            formatted: schedule.formatted(),
            schedule,
            frame: None,
            dry_run: false,
        }
    }
}

pub struct ControlService {
    client: ModbusClient,
    journal: Option<JournalStore>,
    journal_keep: i64,
    batteries: Vec<DeviceIdentity>,
    layout: ScheduleLayout,
    /// Held across schedule read-modify-write cycles.
    schedule_lock: Mutex<()>,
}

impl ControlService {
    pub fn new(
        client: ModbusClient,
        journal: Option<JournalStore>,
        config: &ControlConfig,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client,
            journal,
            journal_keep: config.journal_keep,
            batteries: config.batteries.clone(),
            layout: ScheduleLayout::new(config.schedule_base_register)?,
            schedule_lock: Mutex::new(()),
        })
    }

    pub fn client(&self) -> &ModbusClient {
        &self.client
    }

    /// Encodes a holding register write and, unless `dry_run` is set, sends it.
    pub async fn write_register(
        &self,
        request: WriteRegisterRequest,
    ) -> Result<WriteRegisterResponse, ServiceError> {
        let device_address = narrow_device_address(request.device_address)?;
        let register_address = narrow_register_address(request.register_address)?;
        if !request.data_type.is_writable() {
            return Err(ServiceError::Validation(format!(
                "data_type {} cannot be written",
                request.data_type
            )));
        }

        let command = encode_write(
            device_address,
            register_address,
            request.data_type,
            request.value,
        )?;
        let frame = command.frame.to_hex();
        let response = WriteRegisterResponse {
            device_address,
            register_address,
            data_type: request.data_type,
            words: command.words.clone(),
            frame: frame.clone(),
            dry_run: request.dry_run,
        };

        if request.dry_run {
            info!(
                device_address,
                register_address,
                data_type = %request.data_type,
                value = request.value,
                frame = %frame,
                "dry run: register write not transmitted"
            );
            self.journal_command(WRITE_REGISTER_ACTION, device_address, &frame, true, Outcome::DryRun)
                .await;
            return Ok(response);
        }

        info!(
            device_address,
            register_address,
            data_type = %request.data_type,
            value = request.value,
            frame = %frame,
            "writing holding register"
        );
        let result = self
            .client
            .write_registers(device_address, command.offset, &command.words)
            .await;
        self.settle(WRITE_REGISTER_ACTION, device_address, &frame, result)
            .await?;
        Ok(response)
    }

    pub async fn read_register(
        &self,
        request: ReadRegisterRequest,
    ) -> Result<ReadRegisterResponse, ServiceError> {
        let device_address = narrow_device_address(request.device_address)?;
        let register_address = narrow_register_address(request.register_address)?;
        let offset = register_offset(request.kind, register_address)?;

        let words = match self
            .client
            .read_range(
                device_address,
                request.kind,
                offset,
                request.data_type.register_count(),
            )
            .await
        {
            Ok(words) => {
                count_command(READ_REGISTER_ACTION, "ok");
                words
            }
            Err(err) => {
                count_command(READ_REGISTER_ACTION, Outcome::Failed.as_str());
                return Err(err.into());
            }
        };
        let value = decode_value(&words, request.data_type)?;

        Ok(ReadRegisterResponse {
            device_address,
            register_address,
            data_type: request.data_type,
            kind: request.kind,
            words,
            value,
        })
    }

    /// Adds one slot to a battery's weekly schedule.
    pub async fn set_schedule_slot(
        &self,
        request: SetScheduleSlotRequest,
    ) -> Result<ScheduleResponse, ServiceError> {
        let slot = ScheduleSlot::new(
            narrow_u8("start_hour", request.start_hour)?,
            narrow_u8("start_minute", request.start_minute)?,
            narrow_u8("duration", request.duration)?,
            request.mode,
        )?;
        let day = request.day;
        self.edit_schedule(
            SET_SCHEDULE_SLOT_ACTION,
            &request.battery,
            request.dry_run,
            |schedule| schedule.add_slot(day, slot).map_err(ServiceError::from),
        )
        .await
    }

    /// Empties one day, or every day for `all`. Power limits are kept.
    pub async fn clear_schedule(
        &self,
        request: ClearScheduleRequest,
    ) -> Result<ScheduleResponse, ServiceError> {
        let selector = request.day;
        self.edit_schedule(
            CLEAR_SCHEDULE_ACTION,
            &request.battery,
            request.dry_run,
            |schedule| {
                schedule.clear(selector);
                Ok(())
            },
        )
        .await
    }

    pub async fn set_schedule_power(
        &self,
        request: SetSchedulePowerRequest,
    ) -> Result<ScheduleResponse, ServiceError> {
        if request.pin.is_none() && request.pout.is_none() {
            return Err(ServiceError::Validation(
                "at least one of pin or pout is required".to_string(),
            ));
        }
        let pin = request
            .pin
            .map(|value| narrow_u16("pin", value))
            .transpose()?;
        let pout = request
            .pout
            .map(|value| narrow_u16("pout", value))
            .transpose()?;

        self.edit_schedule(
            SET_SCHEDULE_POWER_ACTION,
            &request.battery,
            request.dry_run,
            |schedule| {
                schedule.set_power(pin, pout);
                Ok(())
            },
        )
        .await
    }

    pub async fn get_schedule(&self, battery: &str) -> Result<ScheduleResponse, ServiceError> {
        let battery = self.battery(battery)?;
        let schedule = self.fetch_schedule(&battery).await?;
        Ok(ScheduleResponse::new(&battery, schedule))
    }

    pub async fn recent_journal(&self, limit: i64) -> Result<Vec<JournalEntry>, ServiceError> {
        let journal = self.journal.as_ref().ok_or(ServiceError::JournalDisabled)?;
        Ok(journal.recent(limit).await?)
    }

    fn battery(&self, isn: &str) -> Result<DeviceIdentity, ServiceError> {
        self.batteries
            .iter()
            .find(|battery| battery.isn == isn)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownBattery(isn.to_string()))
    }

    async fn fetch_schedule(
        &self,
        battery: &DeviceIdentity,
    ) -> Result<BatterySchedule, ServiceError> {
        let offset = register_offset(RegisterKind::Holding, self.layout.base_register)?;
        let words = self
            .client
            .read_range(
                battery.device_address,
                RegisterKind::Holding,
                offset,
                BLOCK_REGISTERS,
            )
            .await?;
        self.layout
            .decode(&words)
            .map_err(ServiceError::CorruptSchedule)
    }

    async fn edit_schedule<F>(
        &self,
        action: &'static str,
        battery: &str,
        dry_run: bool,
        edit: F,
    ) -> Result<ScheduleResponse, ServiceError>
    where
        F: FnOnce(&mut BatterySchedule) -> Result<(), ServiceError>,
    {
        let battery = self.battery(battery)?;
        let _guard = self.schedule_lock.lock().await;

        let mut schedule = self.fetch_schedule(&battery).await?;
        edit(&mut schedule)?;

        let offset = register_offset(RegisterKind::Holding, self.layout.base_register)?;
        let words = self.layout.encode(&schedule);
        let frame = write_multiple_registers_frame(battery.device_address, offset, &words)?;
        let frame_hex = frame.to_hex();

        let mut response = ScheduleResponse::new(&battery, schedule);
        response.frame = Some(frame_hex.clone());
        response.dry_run = dry_run;

        if dry_run {
            info!(
                action,
                battery = %battery.isn,
                device_address = battery.device_address,
                frame = %frame_hex,
                "dry run: schedule write not transmitted"
            );
            self.journal_command(action, battery.device_address, &frame_hex, true, Outcome::DryRun)
                .await;
            return Ok(response);
        }

        info!(
            action,
            battery = %battery.isn,
            device_address = battery.device_address,
            slots = response.schedule.slot_count(),
            "writing battery schedule"
        );
        let result = self
            .client
            .write_registers(battery.device_address, offset, &words)
            .await;
        self.settle(action, battery.device_address, &frame_hex, result)
            .await?;
        Ok(response)
    }

    /// Journals and counts a transmitted command, then hands back its result.
    async fn settle(
        &self,
        action: &'static str,
        device_address: u8,
        frame_hex: &str,
        result: Result<(), ClientError>,
    ) -> Result<(), ServiceError> {
        let outcome = match &result {
            Ok(()) => Outcome::Sent,
            Err(err) => {
                warn!(action, device_address, error = %err, "command failed");
                Outcome::Failed
            }
        };
        self.journal_command(action, device_address, frame_hex, false, outcome)
            .await;
        result.map_err(ServiceError::from)
    }

    async fn journal_command(
        &self,
        action: &'static str,
        device_address: u8,
        frame_hex: &str,
        dry_run: bool,
        outcome: Outcome,
    ) {
        count_command(action, outcome.as_str());

        let Some(journal) = &self.journal else {
            return;
        };
        let record = CommandRecord {
            action,
            device_address,
            frame_hex,
            dry_run,
            outcome,
        };
        if let Err(err) = journal.record(&record).await {
            warn!(action, error = %err, "journal record failed");
            return;
        }
        if let Err(err) = journal.prune_keep_latest(self.journal_keep).await {
            warn!(error = %err, "journal prune failed");
        }
    }
}

fn count_command(action: &'static str, outcome: &'static str) {
    metrics::counter!(COMMANDS_METRIC, "action" => action, "outcome" => outcome).increment(1);
}

fn narrow_device_address(value: i64) -> Result<u8, ServiceError> {
    match u8::try_from(value) {
        Ok(address) if address >= 1 => Ok(address),
        _ => Err(ServiceError::Validation(format!(
            "device_address must be between 1 and 255, got {value}"
        ))),
    }
}

fn narrow_register_address(value: i64) -> Result<u16, ServiceError> {
    match u16::try_from(value) {
        Ok(address) if address >= 1 => Ok(address),
        _ => Err(ServiceError::Validation(format!(
            "register_address must be between 1 and 65535, got {value}"
        ))),
    }
}

fn narrow_u8(field: &str, value: i64) -> Result<u8, ServiceError> {
    u8::try_from(value)
        .map_err(|_| ServiceError::Validation(format!("{field} {value} is out of range")))
}

fn narrow_u16(field: &str, value: i64) -> Result<u16, ServiceError> {
    u16::try_from(value).map_err(|_| {
        ServiceError::Validation(format!("{field} must be between 0 and 65535, got {value}"))
    })
}
