use std::cmp::min;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tracing::{debug, info, warn};

use rtu_codec::{CodecError, FunctionCode, Response, MAX_WRITE_REGISTERS};
use types::RegisterKind;

/// How frames reach the device.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Modbus TCP (MBAP framing), handled by tokio-modbus.
    #[default]
    Tcp,
    /// Raw RTU frames (CRC framed) tunnelled through a TCP serial gateway.
    RtuOverTcp,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "rtu_over_tcp" | "rtu" => Ok(TransportKind::RtuOverTcp),
            other => Err(format!("unknown transport {other:?}")),
        }
    }
}

/// Configuration options for connecting to the inverter's Modbus endpoint.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Maximum number of registers to read in a single request; devices with quirks may require lower batch sizes.
    pub max_batch_size: Option<u16>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Optional delay between split reads to placate slower devices.
    pub inter_read_delay_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            transport: TransportKind::Tcp,
            max_batch_size: None,
            timeout_ms: 1_000,
            retry_count: 2,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            inter_read_delay_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("modbus transport error: {0}")]
    Modbus(io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("register address overflow")]
    AddressOverflow,
    #[error("cannot write {0} registers in one request")]
    TooManyRegisters(usize),
    #[error("frame error: {0}")]
    Codec(#[from] CodecError),
    #[error("device rejected function {function:#04x}: {name} ({code:#04x})")]
    Exception {
        function: u8,
        code: u8,
        name: &'static str,
    },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Exceptions and argument errors will not go away by asking again.
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::Exception { .. }
                | ClientError::AddressOverflow
                | ClientError::TooManyRegisters(_)
                | ClientError::InvalidAddress(..)
        )
    }
}

/// A register write observed by the mock link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub unit_id: u8,
    pub offset: u16,
    pub words: Vec<u16>,
}

/// In-memory register bank standing in for a device.
#[derive(Debug, Default)]
struct MockBank {
    registers: HashMap<(u8, RegisterKind, u16), u16>,
    writes: Vec<MockWrite>,
    offline: bool,
}

#[derive(Debug)]
enum Link {
    Idle,
    Tcp(Context),
    Rtu(TcpStream),
    Mock(MockBank),
}

#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Read {
        kind: RegisterKind,
        start: u16,
        count: u16,
    },
    Write {
        start: u16,
        words: &'a [u16],
    },
}

#[derive(Debug)]
enum Reply {
    Registers(Vec<u16>),
    Written,
}

#[derive(Debug)]
pub struct ModbusClient {
    config: ClientConfig,
    link: Mutex<Link>,
}

impl ModbusClient {
    /// Dials the device up front so configuration errors surface immediately.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let link = open_link(&config).await?;
        Ok(Self {
            config,
            link: Mutex::new(link),
        })
    }

    /// A client that dials on first use and redials after transport failures.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::Idle),
        }
    }

    /// A client backed by an in-memory register bank instead of a device.
    pub fn new_mock(config: ClientConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::Mock(MockBank::default())),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn read_range(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut link = self.link.lock().await;
        let batch_size = self
            .config
            .max_batch_size
            .unwrap_or(count)
            .clamp(1, rtu_codec::MAX_READ_REGISTERS);
        let mut remaining = count;
        let mut offset = 0u16;
        let mut out = Vec::with_capacity(count as usize);

        while remaining > 0 {
            let chunk = min(remaining, batch_size);
            let chunk_start = u16::try_from(u32::from(start) + u32::from(offset))
                .map_err(|_| ClientError::AddressOverflow)?;
            let request = Request::Read {
                kind,
                start: chunk_start,
                count: chunk,
            };
            match self.execute(&mut link, unit_id, request).await? {
                Reply::Registers(values) if values.len() == usize::from(chunk) => out.extend(values),
                Reply::Registers(values) => {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "expected {chunk} registers, got {}",
                        values.len()
                    )))
                }
                Reply::Written => {
                    return Err(ClientError::UnexpectedResponse(
                        "write echo in reply to read".to_string(),
                    ))
                }
            }
            remaining -= chunk;
            offset += chunk;

            if remaining > 0 {
                if let Some(delay_ms) = self.config.inter_read_delay_ms {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Ok(out)
    }

    /// Writes consecutive holding registers in one request (0x06 for one word, 0x10 otherwise).
    pub async fn write_registers(
        &self,
        unit_id: u8,
        start: u16,
        words: &[u16],
    ) -> Result<(), ClientError> {
        if words.is_empty() {
            return Ok(());
        }
        if words.len() > usize::from(MAX_WRITE_REGISTERS) {
            return Err(ClientError::TooManyRegisters(words.len()));
        }
        u16::try_from(u32::from(start) + words.len() as u32 - 1)
            .map_err(|_| ClientError::AddressOverflow)?;

        let mut link = self.link.lock().await;
        match self
            .execute(&mut link, unit_id, Request::Write { start, words })
            .await?
        {
            Reply::Written => Ok(()),
            Reply::Registers(_) => Err(ClientError::UnexpectedResponse(
                "register data in reply to write".to_string(),
            )),
        }
    }

    async fn execute(
        &self,
        link: &mut Link,
        unit_id: u8,
        request: Request<'_>,
    ) -> Result<Reply, ClientError> {
        let mut attempts = 0usize;

        loop {
            let error = match self.attempt(link, unit_id, request).await {
                Ok(reply) => {
                    debug!(unit_id, ?request, "modbus request ok");
                    return Ok(reply);
                }
                Err(err) if !err.is_retryable() => {
                    warn!(unit_id, ?request, error = %err, "modbus request rejected");
                    return Err(err);
                }
                Err(err) => {
                    warn!(unit_id, ?request, attempt = attempts, error = %err, "modbus request error");
                    link.reset();
                    err
                }
            };

            if attempts >= self.config.retry_count {
                return Err(error);
            }

            let delay_ms = self.retry_delay_ms(attempts);
            attempts += 1;
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn attempt(
        &self,
        link: &mut Link,
        unit_id: u8,
        request: Request<'_>,
    ) -> Result<Reply, ClientError> {
        if matches!(link, Link::Idle) {
            *link = open_link(&self.config).await?;
        }
        timeout(
            Duration::from_millis(self.config.timeout_ms),
            link.execute(unit_id, request),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            timeout_ms: self.config.timeout_ms,
        })?
    }

    fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.config.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.config.retry_max_backoff_ms.max(base);
        min(delay, max)
    }

    /// Seeds mock registers. No-op on a real link.
    pub async fn mock_preload(&self, unit_id: u8, kind: RegisterKind, start: u16, words: &[u16]) {
        if let Link::Mock(bank) = &mut *self.link.lock().await {
            for (index, word) in words.iter().enumerate() {
                bank.registers
                    .insert((unit_id, kind, start.wrapping_add(index as u16)), *word);
            }
        }
    }

    /// Writes the mock link has received so far.
    pub async fn mock_writes(&self) -> Vec<MockWrite> {
        match &*self.link.lock().await {
            Link::Mock(bank) => bank.writes.clone(),
            _ => Vec::new(),
        }
    }

    /// Makes every mock request fail with a connection error.
    pub async fn mock_set_offline(&self, offline: bool) {
        if let Link::Mock(bank) = &mut *self.link.lock().await {
            bank.offline = offline;
        }
    }
}

async fn open_link(config: &ClientConfig) -> Result<Link, ClientError> {
    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .map_err(|_| ClientError::InvalidAddress(config.host.clone(), config.port))?;
    let connect_timeout = Duration::from_millis(config.timeout_ms);
    let link = match config.transport {
        TransportKind::Tcp => timeout(connect_timeout, tcp::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout {
                timeout_ms: config.timeout_ms,
            })?
            .map(Link::Tcp)?,
        TransportKind::RtuOverTcp => timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout {
                timeout_ms: config.timeout_ms,
            })?
            .map(Link::Rtu)?,
    };
    info!(%addr, transport = ?config.transport, "modbus link connected");
    Ok(link)
}

/// Pairs an RTU reply with the request it answers. A write only counts when the
/// echo repeats the function, offset and value or quantity that were sent.
fn match_reply(request: Request<'_>, response: Response) -> Result<Reply, ClientError> {
    match (request, response) {
        (_, Response::Exception { function, code, .. }) => Err(ClientError::Exception {
            function,
            code,
            name: rtu_codec::exception_name(code),
        }),
        (Request::Read { kind, .. }, Response::Registers { function, words, .. })
            if function == FunctionCode::for_read(kind) =>
        {
            Ok(Reply::Registers(words))
        }
        (Request::Write { start, words: [word] }, Response::SingleWritten { offset, value, .. })
            if offset == start && value == *word =>
        {
            Ok(Reply::Written)
        }
        (Request::Write { start, words }, Response::MultipleWritten { offset, quantity, .. })
            if words.len() > 1 && offset == start && usize::from(quantity) == words.len() =>
        {
            Ok(Reply::Written)
        }
        (request, response) => Err(ClientError::UnexpectedResponse(format!(
            "{response:?} does not answer {request:?}"
        ))),
    }
}

/// Exception descriptions as tokio-modbus renders them.
const TCP_EXCEPTIONS: [(u8, &str); 9] = [
    (0x01, "Illegal function"),
    (0x02, "Illegal data address"),
    (0x03, "Illegal data value"),
    (0x04, "Server device failure"),
    (0x05, "Acknowledge"),
    (0x06, "Server device busy"),
    (0x08, "Memory parity error"),
    (0x0A, "Gateway path unavailable"),
    (0x0B, "Gateway target device failed to respond"),
];

/// tokio-modbus 0.9 reports device exceptions as an `io::Error` whose inner
/// `ExceptionResponse` is not exported, so the codes come back from its message
/// ("Modbus function 6: Illegal data address"). Anything else stays a transport error.
fn tcp_error(err: io::Error) -> ClientError {
    let parsed = match (err.kind(), err.get_ref()) {
        (io::ErrorKind::Other, Some(inner)) => parse_tcp_exception(&inner.to_string()),
        _ => None,
    };
    match parsed {
        Some((function, code)) => ClientError::Exception {
            function: function | 0x80,
            code,
            name: rtu_codec::exception_name(code),
        },
        None => ClientError::Modbus(err),
    }
}

fn parse_tcp_exception(message: &str) -> Option<(u8, u8)> {
    let (function, description) = message
        .strip_prefix("Modbus function ")?
        .split_once(": ")?;
    let function = function.parse::<u8>().ok()?;
    TCP_EXCEPTIONS
        .iter()
        .find(|(_, text)| *text == description)
        .map(|(code, _)| (function, *code))
}

impl Link {
    /// Drops a network connection so the next attempt redials. Mock banks stay.
    fn reset(&mut self) {
        if matches!(self, Link::Tcp(_) | Link::Rtu(_)) {
            *self = Link::Idle;
        }
    }

    async fn execute(&mut self, unit_id: u8, request: Request<'_>) -> Result<Reply, ClientError> {
        match self {
            Link::Idle => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "modbus link not connected",
            ))),
            Link::Tcp(ctx) => {
                ctx.set_slave(Slave(unit_id));
                match request {
                    Request::Read {
                        kind: RegisterKind::Holding,
                        start,
                        count,
                    } => ctx
                        .read_holding_registers(start, count)
                        .await
                        .map(Reply::Registers)
                        .map_err(tcp_error),
                    Request::Read {
                        kind: RegisterKind::Input,
                        start,
                        count,
                    } => ctx
                        .read_input_registers(start, count)
                        .await
                        .map(Reply::Registers)
                        .map_err(tcp_error),
                    Request::Write { start, words: [word] } => ctx
                        .write_single_register(start, *word)
                        .await
                        .map(|_| Reply::Written)
                        .map_err(tcp_error),
                    Request::Write { start, words } => ctx
                        .write_multiple_registers(start, words)
                        .await
                        .map(|_| Reply::Written)
                        .map_err(tcp_error),
                }
            }
            Link::Rtu(stream) => {
                let frame = match request {
                    Request::Read { kind, start, count } => {
                        rtu_codec::read_registers_frame(unit_id, kind, start, count)?
                    }
                    Request::Write { start, words } => {
                        rtu_codec::write_registers_frame(unit_id, start, words)?
                    }
                };
                stream.write_all(frame.as_bytes()).await?;
                let reply = read_rtu_reply(stream).await?;
                let response = rtu_codec::decode_response(&reply)?;
                if response.device_address() != unit_id {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "reply from device {} while talking to {unit_id}",
                        response.device_address()
                    )));
                }
                match_reply(request, response)
            }
            Link::Mock(bank) => {
                if bank.offline {
                    return Err(ClientError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "mock device offline",
                    )));
                }
                match request {
                    Request::Read { kind, start, count } => {
                        let words = (0..count)
                            .map(|index| {
                                bank.registers
                                    .get(&(unit_id, kind, start.wrapping_add(index)))
                                    .copied()
                                    .unwrap_or(0)
                            })
                            .collect();
                        Ok(Reply::Registers(words))
                    }
                    Request::Write { start, words } => {
                        for (index, word) in words.iter().enumerate() {
                            bank.registers.insert(
                                (unit_id, RegisterKind::Holding, start.wrapping_add(index as u16)),
                                *word,
                            );
                        }
                        bank.writes.push(MockWrite {
                            unit_id,
                            offset: start,
                            words: words.to_vec(),
                        });
                        Ok(Reply::Written)
                    }
                }
            }
        }
    }
}

/// Reads one RTU reply; its length follows from the function code and byte count.
async fn read_rtu_reply(stream: &mut TcpStream) -> Result<Vec<u8>, ClientError> {
    let mut reply = vec![0u8; 3];
    stream.read_exact(&mut reply).await?;

    let function = reply[1];
    let remaining = if function & 0x80 != 0 {
        2
    } else {
        match function {
            0x03 | 0x04 => usize::from(reply[2]) + 2,
            0x06 | 0x10 => 5,
            other => {
                return Err(ClientError::UnexpectedResponse(format!(
                    "unknown function code {other:#04x}"
                )))
            }
        }
    };

    let head = reply.len();
    reply.resize(head + remaining, 0);
    stream.read_exact(&mut reply[head..]).await?;
    Ok(reply)
}
