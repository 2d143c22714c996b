use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use futures::future;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_modbus::{server, Request, Response};
use tracing::{debug, info, warn};

use crate::codec::{ascii_to_words, Address, Quantity, Word};
use crate::registers::{Encoding, RegisterMap, Table};

const RESET_ALARMS_ADDR: Address = 5003;
const ALARMS_ADDR: Address = 6100;
const ALARM_COUNT: Quantity = 7;
const FRESH_TEMP_ADDR: Address = 6200;

#[derive(Debug, Clone, Default)]
/// A raw Modbus register table.
pub struct Registers(HashMap<Address, Word>);

impl Registers {
    /// Insert new consecutive registers with `words` values starting at `addr` address.
    pub fn insert(&mut self, addr: Address, words: &[Word]) {
        for (i, value) in words.iter().enumerate() {
            self.0.insert(addr + i as Address, *value);
        }
    }

    pub fn get(&self, addr: Address) -> Option<Word> {
        self.0.get(&addr).copied()
    }

    /// Read `cnt` consecutive registers starting at `addr`.
    pub fn read(&self, addr: Address, cnt: Quantity) -> Result<Vec<Word>, io::Error> {
        (addr..addr.saturating_add(cnt))
            .map(|reg_addr| {
                self.get(reg_addr).ok_or_else(|| {
                    // TODO: answer with an IllegalDataAddress exception once the server API allows it
                    debug!(reg_addr, "read of unmapped register");
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no register at address {reg_addr}"),
                    )
                })
            })
            .collect()
    }

    /// Write `words` into existing consecutive registers starting at `addr`.
    pub fn write(&mut self, addr: Address, words: &[Word]) -> Result<(), io::Error> {
        for (i, value) in words.iter().enumerate() {
            let reg_addr = addr + i as Address;
            let Some(r) = self.0.get_mut(&reg_addr) else {
                debug!(reg_addr, "write to unmapped register");
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no register at address {reg_addr}"),
                ));
            };
            *r = *value;
        }

        Ok(())
    }
}

/// Register image of a CASA unit.
#[derive(Debug, Clone)]
pub struct CasaUnit {
    pub input_registers: Registers,
    pub holding_registers: Registers,
    ticks: u64,
}

impl Default for CasaUnit {
    fn default() -> Self {
        Self::new("CASA R5H", "SN12345678", (1, 0, 0))
    }
}

impl CasaUnit {
    /// Unit with every mapped register present and plausible readings.
    pub fn new(model: &str, serial: &str, (major, minor, build): (Word, Word, Word)) -> Self {
        let mut input_registers = Registers::default();
        let mut holding_registers = Registers::default();

        for group in RegisterMap::casa().groups() {
            let registers = match group.table {
                Table::Input => &mut input_registers,
                Table::Holding => &mut holding_registers,
            };
            for register in group.registers() {
                let words = match register.encoding {
                    Encoding::Ascii(count) => vec![0; usize::from(count)],
                    _ => vec![0],
                };
                registers.insert(register.addr, &words);
            }
        }

        input_registers.insert(6000, &[major, minor, build]);
        input_registers.insert(6003, &ascii_to_words(model, 8));
        input_registers.insert(6011, &ascii_to_words(serial, 8));
        // Fresh, supply before/after re-heater, extract, exhaust
        input_registers.insert(FRESH_TEMP_ADDR, &[185, 195, 200, 210, 220]);
        input_registers.insert(6211, &[600, 590, 45]);
        input_registers.insert(6300, &[50, 50, 0]);
        input_registers.insert(6233, &[85]);

        holding_registers.insert(5000, &[2]);
        holding_registers.insert(5100, &[210, 30, 30]);
        holding_registers.insert(5200, &[30, 30, 50, 50, 80, 80, 60]);

        Self {
            input_registers,
            holding_registers,
            ticks: 0,
        }
    }

    /// Let the outdoor temperature wander between 18.0 and 18.9 °C.
    pub fn update_state(&mut self) {
        self.ticks += 1;
        let fresh = 180 + (self.ticks % 10) as Word;
        self.input_registers.insert(FRESH_TEMP_ADDR, &[fresh]);
    }

    fn write_holding(&mut self, addr: Address, words: &[Word]) -> Result<(), io::Error> {
        self.holding_registers.write(addr, words)?;

        let reset = self.holding_registers.get(RESET_ALARMS_ADDR).unwrap_or(0);
        if reset != 0 {
            info!("alarms reset");
            self.input_registers
                .insert(ALARMS_ADDR, &vec![0; usize::from(ALARM_COUNT)]);
            self.holding_registers.insert(RESET_ALARMS_ADDR, &[0]);
        }
        Ok(())
    }

    fn service_call(&mut self, req: Request) -> future::Ready<Result<Response, io::Error>> {
        let response = match req {
            Request::ReadInputRegisters(addr, cnt) => self
                .input_registers
                .read(addr, cnt)
                .map(Response::ReadInputRegisters),
            Request::ReadHoldingRegisters(addr, cnt) => self
                .holding_registers
                .read(addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister(addr, value) => self
                .write_holding(addr, std::slice::from_ref(&value))
                .map(|()| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => self
                .write_holding(addr, &values)
                .map(|()| Response::WriteMultipleRegisters(addr, values.len() as Quantity)),
            _ => {
                warn!(?req, "unimplemented function code");
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unimplemented function code in request",
                ))
            }
        };
        future::ready(response)
    }
}

#[derive(Debug, Clone, Default)]
/// Shared [`CasaUnit`] served as [tokio_modbus::server::Service](https://docs.rs/tokio-modbus/latest/tokio_modbus/server/trait.Service.html).
pub struct Simulator(pub Arc<Mutex<CasaUnit>>);

impl Simulator {
    pub fn new(unit: CasaUnit) -> Self {
        Self(Arc::new(Mutex::new(unit)))
    }

    pub fn holding_register(&self, addr: Address) -> Option<Word> {
        self.0.lock().holding_registers.get(addr)
    }

    pub fn input_register(&self, addr: Address) -> Option<Word> {
        self.0.lock().input_registers.get(addr)
    }

    pub fn set_input_registers(&self, addr: Address, words: &[Word]) {
        self.0.lock().input_registers.insert(addr, words);
    }

    pub fn set_holding_registers(&self, addr: Address, words: &[Word]) {
        self.0.lock().holding_registers.insert(addr, words);
    }

    /// Call [`CasaUnit::update_state`] every `period`.
    pub fn spawn_state_updates(&self, period: Duration) -> JoinHandle<()> {
        let unit = Arc::clone(&self.0);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                unit.lock().update_state();
            }
        })
    }
}

impl tokio_modbus::server::Service for Simulator {
    type Request = Request<'static>;
    type Response = Response;
    type Error = io::Error;
    type Future = future::Ready<Result<Self::Response, Self::Error>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        self.0.lock().service_call(req)
    }
}

/// Bind `socket_addr` and serve `simulator` forever.
///
/// Returns the bound address, useful when binding port 0.
pub async fn spawn_tcp_simulator(
    socket_addr: SocketAddr,
    simulator: Simulator,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(socket_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "simulator listening");

    let handle = tokio::spawn(async move {
        let server = server::tcp::Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(simulator.clone()));
        let on_connected = |stream, socket_addr| async move {
            server::tcp::accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            warn!(%err, "simulator connection failed");
        };
        if let Err(err) = server.serve(&on_connected, on_process_error).await {
            warn!(%err, "simulator stopped");
        }
    });

    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_exposes_every_mapped_register() {
        let unit = CasaUnit::default();
        for group in RegisterMap::casa().groups() {
            let registers = match group.table {
                Table::Input => &unit.input_registers,
                Table::Holding => &unit.holding_registers,
            };
            for block in group.blocks() {
                for register in &block.registers {
                    assert!(
                        registers.read(register.addr, register.word_count()).is_ok(),
                        "{}/{}",
                        group.name,
                        register.key
                    );
                }
            }
        }
    }

    #[test]
    fn test_unmapped_register_is_an_error() {
        let unit = CasaUnit::default();
        assert!(unit.input_registers.read(6230, 4).is_err());
        let mut holding = unit.holding_registers.clone();
        assert!(holding.write(4000, &[1]).is_err());
    }

    #[test]
    fn test_reset_alarms_clears_alarms() {
        let mut unit = CasaUnit::default();
        unit.input_registers.insert(ALARMS_ADDR, &[1, 1]);
        unit.write_holding(RESET_ALARMS_ADDR, &[1]).unwrap();
        assert_eq!(unit.input_registers.read(ALARMS_ADDR, 2).unwrap(), vec![0, 0]);
        assert_eq!(unit.holding_registers.get(RESET_ALARMS_ADDR), Some(0));
    }

    #[test]
    fn test_update_state_moves_fresh_temp() {
        let mut unit = CasaUnit::default();
        unit.update_state();
        assert_eq!(unit.input_registers.get(FRESH_TEMP_ADDR), Some(181));
    }
}
