use crate::codec::{ascii_from_words, Address, Decode, Encode, Quantity, Word, WordsCountError};
use crate::error::{Error, Result};
use crate::value::{Value, ValueKind};

pub const DEVICE_INFO: &str = "Device_Info";
pub const SETPOINTS: &str = "Setpoints";
pub const ALARMS: &str = "Alarms";
pub const SENSORS: &str = "Sensors";
pub const SENSORS2: &str = "Sensors2";
pub const COMMANDS: &str = "Commands";
pub const UNIT_STATUSES: &str = "UnitStatuses";
pub const CONFIG: &str = "Config";
/// Group of values computed locally from other datapoints; never read from the unit.
pub const VIRTUAL_SENSORS: &str = "VirtualSensors";

pub const FW_MAJOR: &str = "FW_Maj";
pub const FW_MINOR: &str = "FW_Min";
pub const FW_BUILD: &str = "FW_Build";
pub const MODEL: &str = "Model";
pub const SERIAL: &str = "Serial";
pub const ACTIVE_ALARMS: &str = "Active_Alarms";
pub const FRESH_TEMP: &str = "Fresh_Temp";
pub const SUPPLY_TEMP_BEFORE_REHEATER: &str = "Supply_Temp1";
pub const EXTRACT_TEMP: &str = "Extract_Temp";
pub const EFFICIENCY: &str = "Efficiency";

// https://en.wikipedia.org/wiki/Modbus#Function_codes_4_(read_input_registers)_and_3_(read_holding_registers)
pub const MAX_CNT_PER_REQUEST: Quantity = 123;

pub const OP_MODES: &[&str] = &["stopped", "away", "home", "boost", "travel"];

const TEMPERATURE: Encoding = Encoding::Scaled {
    divisor: 10.0,
    signed: true,
};
const TENTHS: Encoding = Encoding::Scaled {
    divisor: 10.0,
    signed: false,
};

/// Modbus register table a group lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Read with function code 3, written with function code 6.
    Holding,
    /// Read with function code 4.
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// How the raw register words map to a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    Unsigned,
    Signed,
    /// Fixed point: actual value = raw / divisor.
    Scaled { divisor: f64, signed: bool },
    /// Non-zero is `true`.
    Boolean,
    /// Raw value is an index into the labels.
    Enumerated(&'static [&'static str]),
    /// Two ASCII characters per register over the given number of registers.
    Ascii(Quantity),
}

/// When a group takes part in a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every cycle.
    Always,
    /// Every cycle until the unit reported its firmware version.
    UntilIdentified,
    /// At most once per setpoint refresh interval.
    Periodic,
    /// Never polled, read only on explicit request.
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeError {
    Mismatch,
    OutOfRange { min: f64, max: f64 },
}

/// Static description of a single datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub key: &'static str,
    /// Display name for presentation layers.
    pub name: &'static str,
    pub addr: Address,
    pub encoding: Encoding,
    pub access: Access,
    pub unit: Option<&'static str>,
    /// Inclusive bounds for writes, in engineering units.
    pub limits: Option<(f64, f64)>,
}

impl Register {
    pub fn new(key: &'static str, name: &'static str, addr: Address, encoding: Encoding) -> Self {
        Self {
            key,
            name,
            addr,
            encoding,
            access: Access::ReadOnly,
            unit: None,
            limits: None,
        }
    }

    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn writable(mut self) -> Self {
        self.access = Access::ReadWrite;
        self
    }

    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    pub fn word_count(&self) -> Quantity {
        match self.encoding {
            Encoding::Ascii(count) => count,
            _ => 1,
        }
    }

    /// First address after this register.
    pub fn end(&self) -> Address {
        self.addr.saturating_add(self.word_count())
    }

    pub fn kind(&self) -> ValueKind {
        match self.encoding {
            Encoding::Unsigned | Encoding::Signed | Encoding::Scaled { .. } => ValueKind::Numeric,
            Encoding::Boolean => ValueKind::Boolean,
            Encoding::Enumerated(_) => ValueKind::EnumIndex,
            Encoding::Ascii(_) => ValueKind::Text,
        }
    }

    /// Enum labels, empty for non-enumerated registers.
    pub fn labels(&self) -> &'static [&'static str] {
        match self.encoding {
            Encoding::Enumerated(labels) => labels,
            _ => &[],
        }
    }

    /// Decode this register from exactly [`Self::word_count`] words.
    pub fn decode(&self, words: &[Word]) -> Result<Value, WordsCountError> {
        let value = match self.encoding {
            Encoding::Unsigned => Value::Numeric(f64::from(u16::from_be_words(words)?)),
            Encoding::Signed => Value::Numeric(f64::from(i16::from_be_words(words)?)),
            Encoding::Scaled { divisor, signed } => {
                let raw = if signed {
                    f64::from(i16::from_be_words(words)?)
                } else {
                    f64::from(u16::from_be_words(words)?)
                };
                Value::Numeric(raw / divisor)
            }
            Encoding::Boolean => Value::Boolean(u16::from_be_words(words)? != 0),
            Encoding::Enumerated(_) => Value::EnumIndex(u16::from_be_words(words)?),
            Encoding::Ascii(count) => {
                if words.len() != usize::from(count) {
                    return Err(WordsCountError {
                        expected: usize::from(count),
                        got: words.len(),
                    });
                }
                Value::Text(ascii_from_words(words))
            }
        };
        Ok(value)
    }

    /// Bring `value` to the kind of this register.
    ///
    /// Whole numbers are accepted for flags (non-zero is `true`) and for enum indexes.
    /// Anything else is returned unchanged and left to [`Self::encode`] to reject.
    pub fn coerce(&self, value: &Value) -> Result<Value, EncodeError> {
        match (self.encoding, value) {
            (Encoding::Boolean, Value::Numeric(v)) if v.fract() == 0.0 => {
                Ok(Value::Boolean(*v != 0.0))
            }
            (Encoding::Enumerated(labels), Value::Numeric(v)) if v.fract() == 0.0 => {
                let max = match labels.len() {
                    0 => f64::from(Word::MAX),
                    len => (len - 1) as f64,
                };
                if (0.0..=max).contains(v) {
                    Ok(Value::EnumIndex(*v as Word))
                } else {
                    Err(EncodeError::OutOfRange { min: 0.0, max })
                }
            }
            _ => Ok(value.clone()),
        }
    }

    /// Encode `value` into the single register word written with function code 6.
    pub fn encode(&self, value: &Value) -> Result<Word, EncodeError> {
        let value = &self.coerce(value)?;
        if let (Some((min, max)), Value::Numeric(v)) = (self.limits, value) {
            if !(min..=max).contains(v) {
                return Err(EncodeError::OutOfRange { min, max });
            }
        }

        match (self.encoding, value) {
            (Encoding::Unsigned, Value::Numeric(v)) => scale_to_word(*v, 1.0, false),
            (Encoding::Signed, Value::Numeric(v)) => scale_to_word(*v, 1.0, true),
            (Encoding::Scaled { divisor, signed }, Value::Numeric(v)) => {
                scale_to_word(*v, divisor, signed)
            }
            (Encoding::Boolean, Value::Boolean(v)) => Ok(Word::from(*v)),
            (Encoding::Enumerated(labels), Value::EnumIndex(index)) => {
                if labels.is_empty() || usize::from(*index) < labels.len() {
                    Ok(*index)
                } else {
                    Err(EncodeError::OutOfRange {
                        min: 0.0,
                        max: (labels.len() - 1) as f64,
                    })
                }
            }
            _ => Err(EncodeError::Mismatch),
        }
    }
}

fn scale_to_word(value: f64, divisor: f64, signed: bool) -> Result<Word, EncodeError> {
    let raw = (value * divisor).round();
    let (min, max) = if signed {
        (f64::from(i16::MIN), f64::from(i16::MAX))
    } else {
        (0.0, f64::from(u16::MAX))
    };
    if !raw.is_finite() || raw < min || raw > max {
        return Err(EncodeError::OutOfRange {
            min: min / divisor,
            max: max / divisor,
        });
    }

    let words = if signed {
        (raw as i16).to_be_words()
    } else {
        (raw as u16).to_be_words()
    };
    Ok(words[0])
}

fn temperature(key: &'static str, name: &'static str, addr: Address) -> Register {
    Register::new(key, name, addr, TEMPERATURE).unit("°C")
}

fn percent(key: &'static str, name: &'static str, addr: Address) -> Register {
    Register::new(key, name, addr, Encoding::Unsigned).unit("%")
}

fn flag(key: &'static str, name: &'static str, addr: Address) -> Register {
    Register::new(key, name, addr, Encoding::Boolean)
}

fn fan_speed(key: &'static str, name: &'static str, addr: Address) -> Register {
    Register::new(key, name, addr, Encoding::Signed)
        .unit("%")
        .writable()
}

/// Consecutive register range fetched with a single read request.
#[derive(Debug, Clone)]
pub struct Block<'a> {
    pub start: Address,
    pub count: Quantity,
    pub registers: Vec<&'a Register>,
}

impl<'a> Block<'a> {
    fn new(registers: Vec<&'a Register>) -> Self {
        let start = registers.iter().map(|r| r.addr).min().unwrap_or_default();
        let end = registers.iter().map(|r| r.end()).max().unwrap_or(start);
        Self {
            start,
            count: end - start,
            registers,
        }
    }

    /// Words of `register` within the block response.
    pub fn words_of<'w>(&self, register: &Register, words: &'w [Word]) -> &'w [Word] {
        let offset = usize::from(register.addr - self.start);
        let end = (offset + usize::from(register.word_count())).min(words.len());
        words.get(offset..end).unwrap_or_default()
    }
}

/// Datapoints read together in one batch.
#[derive(Debug, Clone)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub table: Table,
    pub cadence: Cadence,
    /// Maximum number of registers fetched by a single request.
    pub max_cnt_per_request: Quantity,
    /// Read across unmapped registers to issue fewer requests.
    pub allow_register_gaps: bool,
    registers: Vec<Register>,
}

impl RegisterGroup {
    pub fn new(
        name: &'static str,
        table: Table,
        cadence: Cadence,
        registers: Vec<Register>,
    ) -> Self {
        Self {
            name,
            table,
            cadence,
            max_cnt_per_request: MAX_CNT_PER_REQUEST,
            allow_register_gaps: true,
            registers,
        }
    }

    /// Registers in declaration order.
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn register(&self, key: &str) -> Option<&Register> {
        self.registers.iter().find(|r| r.key == key)
    }

    /// Split the group into read requests of at most `max_cnt_per_request` registers.
    pub fn blocks(&self) -> Vec<Block<'_>> {
        let mut sorted = self.registers.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|r| r.addr);

        let mut blocks = vec![];
        let mut entries: Vec<&Register> = Vec::with_capacity(sorted.len());

        for register in sorted {
            if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
                let max_cond = register.end() - first.addr <= self.max_cnt_per_request;
                let gap_cond = last.end() == register.addr;

                if !(max_cond && (gap_cond || self.allow_register_gaps)) {
                    blocks.push(Block::new(std::mem::take(&mut entries)));
                }
            }
            entries.push(register);
        }

        if !entries.is_empty() {
            blocks.push(Block::new(entries));
        }

        blocks
    }
}

/// Every datapoint the coordinator knows about, grouped for batch reads.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    groups: Vec<RegisterGroup>,
}

impl RegisterMap {
    pub fn new(groups: Vec<RegisterGroup>) -> Self {
        Self { groups }
    }

    /// Register layout of the Swegon CASA R4/R15/R5H units.
    pub fn casa() -> Self {
        let device_info = RegisterGroup::new(
            DEVICE_INFO,
            Table::Input,
            Cadence::UntilIdentified,
            vec![
                Register::new(FW_MAJOR, "Firmware Major", 6000, Encoding::Unsigned),
                Register::new(FW_MINOR, "Firmware Minor", 6001, Encoding::Unsigned),
                Register::new(FW_BUILD, "Firmware Build", 6002, Encoding::Unsigned),
                Register::new(MODEL, "Model", 6003, Encoding::Ascii(8)),
                Register::new(SERIAL, "Serial Number", 6011, Encoding::Ascii(8)),
            ],
        );

        let setpoints = RegisterGroup::new(
            SETPOINTS,
            Table::Holding,
            Cadence::Periodic,
            vec![
                temperature("Temp_SP", "Temperature Setpoint", 5100)
                    .writable()
                    .limits(13.0, 25.0),
                Register::new(
                    "Fireplace_Run_Time",
                    "Fireplace Run Time",
                    5101,
                    Encoding::Unsigned,
                )
                .unit("min")
                .writable()
                .limits(1.0, 60.0),
                temperature("Travelling_Temp_Drop", "Travelling Temperature Drop", 5102)
                    .writable()
                    .limits(0.0, 10.0),
            ],
        );

        let alarms = RegisterGroup::new(
            ALARMS,
            Table::Input,
            Cadence::Always,
            vec![
                flag(ACTIVE_ALARMS, "Active Alarms", 6100),
                flag("Filter_Alarm", "Filter Alarm", 6101),
                flag("Supply_Fan_Alarm", "Supply Fan Alarm", 6102),
                flag("Exhaust_Fan_Alarm", "Exhaust Fan Alarm", 6103),
                flag("Frost_Alarm", "Frost Protection Alarm", 6104),
                flag("Fire_Alarm", "Fire Alarm", 6105),
                flag("Sensor_Alarm", "Sensor Fault", 6106),
            ],
        );

        let sensors = RegisterGroup::new(
            SENSORS,
            Table::Input,
            Cadence::Always,
            vec![
                temperature(FRESH_TEMP, "Fresh Air Temp", 6200),
                temperature(
                    SUPPLY_TEMP_BEFORE_REHEATER,
                    "Supply Temp before re-heater",
                    6201,
                ),
                temperature("Supply_Temp2", "Supply Temp", 6202),
                temperature(EXTRACT_TEMP, "Extract Temp", 6203),
                temperature("Exhaust_Temp", "Exhaust Temp", 6204),
                temperature("Room_Temp", "Room Air Temp", 6205),
                temperature("UP1_Temp", "User Panel 1 Temp", 6206),
                temperature("UP2_Temp", "User Panel 2 Temp", 6207),
                temperature("WR_Temp", "Water Radiator Temp", 6208),
                temperature("PreHeat_Temp", "Pre-Heater Temp", 6209),
                temperature("ExtFresh_Temp", "External Fresh Air Temp", 6210),
                Register::new("CO2_Unf", "CO2 Unfiltered", 6211, Encoding::Unsigned)
                    .unit("ppm"),
                Register::new("CO2_Fil", "CO2 Filtered", 6212, Encoding::Unsigned)
                    .unit("ppm"),
                percent("RH", "Relative Humidity", 6213),
                Register::new("AH", "Absolute Humidity", 6214, TENTHS)
                    .unit("g/m³"),
                Register::new("AH_SP", "Absolute Humidity SP", 6215, TENTHS)
                    .unit("g/m³"),
                Register::new("VOC", "VOC", 6216, Encoding::Unsigned)
                    .unit("ppm"),
                Register::new("Supply_Pressure", "Supply Pressure", 6217, Encoding::Signed)
                    .unit("Pa"),
                Register::new(
                    "Exhaust_Pressure",
                    "Exhaust Pressure",
                    6218,
                    Encoding::Signed,
                )
                .unit("Pa"),
                Register::new("Supply_Flow", "Supply Flow", 6219, Encoding::Unsigned)
                    .unit("m³/h"),
                Register::new("Exhaust_Flow", "Exhaust Flow", 6220, Encoding::Unsigned)
                    .unit("m³/h"),
            ],
        );

        let sensors2 = RegisterGroup::new(
            SENSORS2,
            Table::Input,
            Cadence::Always,
            vec![percent("Heat_Exchanger", "Heat Exchanger", 6233)],
        );

        // Other CASA integrations group Reset_Alarms with Config. It is a command here so that
        // the config options only list tunable parameters.
        let commands = RegisterGroup::new(
            COMMANDS,
            Table::Holding,
            Cadence::Always,
            vec![
                Register::new(
                    "Op_Mode",
                    "Operating Mode",
                    5000,
                    Encoding::Enumerated(OP_MODES),
                )
                .writable(),
                flag("Fireplace_Mode", "Fireplace Mode", 5001).writable(),
                flag("Travelling_Mode", "Travelling Mode", 5002).writable(),
                flag("Reset_Alarms", "Reset Alarms", 5003).writable(),
            ],
        );

        let unit_statuses = RegisterGroup::new(
            UNIT_STATUSES,
            Table::Input,
            Cadence::Always,
            vec![
                percent("Supply_Fan", "Supply Fan", 6300),
                percent("Exhaust_Fan", "Exhaust Fan", 6301),
                percent("Heating_Output", "Heating Output", 6302),
            ],
        );

        let config = RegisterGroup::new(
            CONFIG,
            Table::Holding,
            Cadence::OnDemand,
            vec![
                fan_speed("Away_Supply_Fan", "Away Supply Fan Speed", 5200),
                fan_speed("Away_Exhaust_Fan", "Away Exhaust Fan Speed", 5201),
                fan_speed("Home_Supply_Fan", "Home Supply Fan Speed", 5202),
                fan_speed("Home_Exhaust_Fan", "Home Exhaust Fan Speed", 5203),
                fan_speed("Boost_Supply_Fan", "Boost Supply Fan Speed", 5204),
                fan_speed("Boost_Exhaust_Fan", "Boost Exhaust Fan Speed", 5205),
                Register::new("Boost_Run_Time", "Boost Run Time", 5206, Encoding::Signed)
                    .unit("min")
                    .writable(),
            ],
        );

        Self::new(vec![
            device_info,
            setpoints,
            alarms,
            sensors,
            sensors2,
            commands,
            unit_statuses,
            config,
        ])
    }

    /// Groups in refresh order.
    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Result<&RegisterGroup> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    pub fn lookup(&self, group: &str, key: &str) -> Result<&Register> {
        self.groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.register(key))
            .ok_or_else(|| Error::NotFound {
                group: group.to_string(),
                key: key.to_string(),
            })
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::casa()
    }
}
