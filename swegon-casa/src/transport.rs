//! Single-session Modbus TCP link to the unit.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{tcp::connect_slave, Context, Reader, Writer};
use tokio_modbus::slave::Slave;
use tracing::{debug, info, warn};

use crate::codec::{Address, Quantity, Word};
use crate::config::UnitConfig;
use crate::error::TransportError;
use crate::registers::Table;

/// Register-level access to the unit.
///
/// Implementations execute one operation at a time; concurrent callers queue.
#[async_trait]
pub trait RegisterLink: Send + Sync {
    /// Open the session if it is not open yet.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn read_block(
        &self,
        table: Table,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>, TransportError>;

    async fn write_register(&self, addr: Address, word: Word) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Read(Table, Address, Quantity),
    Write(Address, Word),
}

#[derive(Default)]
struct Session {
    context: Option<Context>,
    /// The last operation failed on the wire.
    suspect: bool,
    /// An operation started and never finished, i.e. its future was dropped.
    in_flight: bool,
}

/// [`RegisterLink`] over a tokio-modbus TCP client.
///
/// Connects on demand. After a failed operation the session is suspect and the
/// next operation reconnects and retries once before giving up.
pub struct ModbusTransport {
    host: String,
    port: u16,
    slave: Slave,
    io_timeout: Duration,
    session: Mutex<Session>,
}

impl ModbusTransport {
    pub fn new(host: impl Into<String>, port: u16, slave_id: u8, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            slave: Slave(slave_id),
            io_timeout,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn from_config(config: &UnitConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.port,
            config.slave_id,
            config.io_timeout(),
        )
    }

    /// Drop the session; the next operation reconnects.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if session.context.take().is_some() {
            info!(host = %self.host, port = self.port, "disconnected");
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| TransportError::Resolve {
                host: self.host.clone(),
                port: self.port,
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::NoAddress {
                host: self.host.clone(),
                port: self.port,
            })
    }

    async fn open(&self) -> Result<Context, TransportError> {
        let socket_addr = self.resolve().await?;
        let context = timeout(self.io_timeout, connect_slave(socket_addr, self.slave))
            .await
            .map_err(|_| TransportError::Timeout(self.io_timeout))?
            .map_err(|source| TransportError::Connect {
                addr: socket_addr,
                source,
            })?;
        info!(%socket_addr, slave = self.slave.0, "connected");
        Ok(context)
    }

    async fn call(&self, request: Request) -> Result<Vec<Word>, TransportError> {
        let mut session = self.session.lock().await;

        let reconnect = session.suspect || session.in_flight;
        if reconnect {
            debug!(?request, "reconnecting suspect session");
            session.context = None;
        }

        let mut result = self.attempt(&mut session, request).await;
        if reconnect {
            if let Err(err) = &result {
                if err.is_link_failure() {
                    warn!(?request, %err, "retrying after reconnect");
                    session.context = None;
                    result = self.attempt(&mut session, request).await;
                }
            }
        }

        match &result {
            Err(err) if err.is_link_failure() => {
                session.context = None;
                session.suspect = true;
            }
            _ => session.suspect = false,
        }

        result
    }

    async fn attempt(
        &self,
        session: &mut Session,
        request: Request,
    ) -> Result<Vec<Word>, TransportError> {
        session.in_flight = true;
        let result = self.dispatch(&mut session.context, request).await;
        session.in_flight = false;
        result
    }

    async fn dispatch(
        &self,
        context: &mut Option<Context>,
        request: Request,
    ) -> Result<Vec<Word>, TransportError> {
        if context.is_none() {
            *context = Some(self.open().await?);
        }
        let Some(context) = context.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let io = async {
            match request {
                Request::Read(Table::Holding, addr, cnt) => {
                    context.read_holding_registers(addr, cnt).await
                }
                Request::Read(Table::Input, addr, cnt) => {
                    context.read_input_registers(addr, cnt).await
                }
                Request::Write(addr, word) => context
                    .write_single_register(addr, word)
                    .await
                    .map(|response| response.map(|()| Vec::new())),
            }
        };

        match timeout(self.io_timeout, io).await {
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
            Ok(Err(err)) => Err(TransportError::Request(err.to_string())),
            Ok(Ok(Err(exc))) => Err(TransportError::Exception(format!("{exc:?}"))),
            Ok(Ok(Ok(words))) => Ok(words),
        }
    }
}

#[async_trait]
impl RegisterLink for ModbusTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.context.is_none() {
            session.context = Some(self.open().await?);
            session.suspect = false;
        }
        Ok(())
    }

    async fn read_block(
        &self,
        table: Table,
        start: Address,
        count: Quantity,
    ) -> Result<Vec<Word>, TransportError> {
        let words = self.call(Request::Read(table, start, count)).await?;
        if words.len() < usize::from(count) {
            return Err(TransportError::ShortResponse {
                expected: count,
                got: words.len(),
            });
        }
        Ok(words)
    }

    async fn write_register(&self, addr: Address, word: Word) -> Result<(), TransportError> {
        self.call(Request::Write(addr, word)).await.map(|_| ())
    }
}
