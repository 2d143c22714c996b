//! Device coordinator: the single entry point to the unit's datapoints.
//!
//! The coordinator owns the register map, the datapoint store, the poll
//! scheduler and the register link. Presentation code only
//!
//! - reads values with [`DeviceCoordinator::get_value`] (never blocks, never fails),
//! - requests writes with [`DeviceCoordinator::write_value`],
//! - subscribes to changes with [`DeviceCoordinator::subscribe`] or
//!   [`DeviceCoordinator::register_update_callback`],
//! - looks up static metadata with [`DeviceCoordinator::register`].
//!
//! Refresh cycles contain failures per group: a group that cannot be read is
//! logged and skipped, the rest of the cycle and all future cycles go on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::UnitConfig;
use crate::error::{Error, Result, TransportError};
use crate::registers::{
    EncodeError, Register, RegisterGroup, RegisterMap, Table, ACTIVE_ALARMS, ALARMS, CONFIG,
    DEVICE_INFO, EFFICIENCY, EXTRACT_TEMP, FRESH_TEMP, FW_BUILD, FW_MAJOR, FW_MINOR, MODEL,
    SENSORS, SERIAL, SUPPLY_TEMP_BEFORE_REHEATER, VIRTUAL_SENSORS,
};
use crate::scheduler::{PollMode, PollScheduler};
use crate::store::{Datapoint, DatapointStore};
use crate::transport::{ModbusTransport, RegisterLink};
use crate::value::{Value, ValueKind};

/// Subscriber told about the key selected with [`DeviceCoordinator::select_config`].
pub const CONFIG_VALUE_SUBSCRIBER: &str = "Config_Value";

pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(20);

const CHANGE_CHANNEL_CAPACITY: usize = 256;

// Below this extract/fresh difference the efficiency is meaningless.
const MIN_EFFICIENCY_SPAN: f64 = 0.5;

/// Receives the new key of an out-of-band change.
pub type UpdateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A datapoint took a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct DatapointChange {
    pub group: String,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub model: String,
    pub serial: String,
    /// `major.minor.build`
    pub firmware: String,
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub planned: Vec<&'static str>,
    pub refreshed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    /// The cycle guard expired and the remaining groups were skipped.
    pub timed_out: bool,
}

pub struct DeviceCoordinator<L = ModbusTransport> {
    map: RegisterMap,
    link: L,
    store: RwLock<DatapointStore>,
    scheduler: Mutex<PollScheduler>,
    callbacks: Mutex<HashMap<String, UpdateCallback>>,
    config_selection: Mutex<usize>,
    identity: RwLock<Option<DeviceIdentity>>,
    fallback_model: Option<String>,
    changes: broadcast::Sender<DatapointChange>,
    wake: Notify,
    cycle_timeout: Duration,
}

impl DeviceCoordinator<ModbusTransport> {
    /// Coordinator for a CASA unit reached over Modbus TCP.
    pub fn from_config(config: &UnitConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = PollScheduler::new(config.scan_interval(), config.scan_interval_fast())
            .with_setpoint_refresh(config.setpoint_refresh());

        Ok(Self::new(
            RegisterMap::casa(),
            ModbusTransport::from_config(config),
            scheduler,
        )
        .with_cycle_timeout(config.cycle_timeout())
        .with_fallback_model(config.device_model.to_string()))
    }
}

impl<L: RegisterLink> DeviceCoordinator<L> {
    pub fn new(map: RegisterMap, link: L, scheduler: PollScheduler) -> Self {
        let mut store = DatapointStore::from_map(&map);
        store.declare(VIRTUAL_SENSORS, EFFICIENCY, ValueKind::Numeric);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            map,
            link,
            store: RwLock::new(store),
            scheduler: Mutex::new(scheduler),
            callbacks: Mutex::new(HashMap::new()),
            config_selection: Mutex::new(0),
            identity: RwLock::new(None),
            fallback_model: None,
            changes,
            wake: Notify::new(),
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
        }
    }

    pub fn with_cycle_timeout(mut self, cycle_timeout: Duration) -> Self {
        self.cycle_timeout = cycle_timeout;
        self
    }

    /// Model name reported until the unit identifies itself.
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Static metadata of a datapoint.
    pub fn register(&self, group: &str, key: &str) -> Result<&Register> {
        self.map.lookup(group, key)
    }

    /// Last known value, `Unknown` if never read.
    pub fn get_value(&self, group: &str, key: &str) -> Value {
        self.store.read().get(group, key)
    }

    pub fn datapoint(&self, group: &str, key: &str) -> Option<Datapoint> {
        self.store.read().datapoint(group, key).cloned()
    }

    pub fn group_values(&self, group: &str) -> BTreeMap<String, Value> {
        self.store.read().all_in_group(group)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatapointChange> {
        self.changes.subscribe()
    }

    pub fn poll_mode(&self) -> PollMode {
        self.scheduler.lock().mode()
    }

    pub fn poll_interval(&self) -> Duration {
        self.scheduler.lock().interval()
    }

    pub fn fast_ticks(&self) -> u32 {
        self.scheduler.lock().fast_ticks()
    }

    pub fn device_identity(&self) -> Option<DeviceIdentity> {
        self.identity.read().clone()
    }

    pub fn model_name(&self) -> Option<String> {
        self.identity
            .read()
            .as_ref()
            .map(|identity| identity.model.clone())
            .filter(|model| !model.is_empty())
            .or_else(|| self.fallback_model.clone())
    }

    pub fn serial_number(&self) -> Option<String> {
        self.identity
            .read()
            .as_ref()
            .map(|identity| identity.serial.clone())
            .filter(|serial| !serial.is_empty())
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.identity
            .read()
            .as_ref()
            .map(|identity| identity.firmware.clone())
    }

    /// Keys of the alarms currently raised.
    pub fn active_alarms(&self) -> Vec<String> {
        self.store
            .read()
            .all_in_group(ALARMS)
            .into_iter()
            .filter(|(key, value)| key != ACTIVE_ALARMS && value.as_bool() == Some(true))
            .map(|(key, _)| key)
            .collect()
    }

    /// Selectable configuration parameters, index to key.
    pub fn config_options(&self) -> BTreeMap<usize, String> {
        self.map
            .group(CONFIG)
            .map(|group| {
                group
                    .registers()
                    .iter()
                    .enumerate()
                    .map(|(index, register)| (index, register.key.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn config_selection(&self) -> usize {
        *self.config_selection.lock()
    }

    /// Register `callback` under `id`, replacing any previous one.
    pub fn register_update_callback<F>(&self, id: impl Into<String>, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.lock().insert(id.into(), Arc::new(callback));
    }

    fn notify_callback(&self, id: &str, new_key: &str) {
        let callback = self.callbacks.lock().get(id).cloned();
        match callback {
            Some(callback) => callback(new_key),
            None => debug!(id, new_key, "no update callback registered"),
        }
    }

    /// Select the configuration parameter `key` and read its current value.
    ///
    /// The [`CONFIG_VALUE_SUBSCRIBER`] callback gets the new key whether the read
    /// succeeded or not; a failed read is returned afterwards.
    pub async fn select_config(&self, key: &str, index: usize) -> Result<()> {
        let register = self.map.lookup(CONFIG, key)?;
        *self.config_selection.lock() = index;

        let result = self.read_register(CONFIG, register).await;
        match &result {
            Ok(value) => debug!(key, index, %value, "config selected"),
            Err(err) => warn!(key, index, %err, "reading selected config value failed"),
        }

        self.notify_callback(CONFIG_VALUE_SUBSCRIBER, key);
        result.map(|_| ())
    }

    /// Write a datapoint to the unit.
    ///
    /// On success the store is updated right away, ahead of the next refresh.
    /// Fast polling is requested in every case, so a failed write is rechecked
    /// against the unit soon.
    pub async fn write_value(&self, group: &str, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let result = self.write_register(group, key, &value).await;

        self.scheduler.lock().request_fast();
        self.wake.notify_one();

        match result {
            Ok(written) => {
                info!(group, key, value = %written, "datapoint written");
                self.apply(group, key, written);
                Ok(())
            }
            Err(err) => {
                warn!(group, key, %value, %err, "write failed");
                Err(err)
            }
        }
    }

    /// Write `value` to the unit and return it as stored, i.e. coerced to the register kind.
    async fn write_register(&self, group: &str, key: &str, value: &Value) -> Result<Value> {
        let register = self.map.lookup(group, key)?;
        let table = self.map.group(group)?.table;
        if !register.is_writable() || table == Table::Input {
            return Err(Error::ReadOnly {
                group: group.to_string(),
                key: key.to_string(),
            });
        }

        let encode_error = |err: EncodeError| match err {
            EncodeError::Mismatch => Error::TypeMismatch {
                group: group.to_string(),
                key: key.to_string(),
                expected: register.kind(),
                actual: value
                    .kind()
                    .map_or_else(|| "unknown".to_string(), |kind| kind.to_string()),
            },
            EncodeError::OutOfRange { min, max } => Error::OutOfRange {
                group: group.to_string(),
                key: key.to_string(),
                value: value
                    .as_f64()
                    .or_else(|| value.as_index().map(f64::from))
                    .unwrap_or(f64::NAN),
                min,
                max,
            },
        };
        let written = register.coerce(value).map_err(encode_error)?;
        let word = register.encode(&written).map_err(encode_error)?;

        debug!(group, key, addr = register.addr, word, "writing register");
        self.link
            .write_register(register.addr, word)
            .await
            .map_err(|source| Error::Write {
                group: group.to_string(),
                key: key.to_string(),
                source,
            })?;
        Ok(written)
    }

    /// Run one refresh cycle. Never fails; see the report for what happened.
    pub async fn refresh_cycle(&self) -> CycleReport {
        let identified = self.firmware_known();
        let plan = self
            .scheduler
            .lock()
            .plan(&self.map, Instant::now(), identified);

        let mut report = CycleReport {
            planned: plan.clone(),
            ..Default::default()
        };

        if timeout(self.cycle_timeout, self.read_groups(&plan, &mut report))
            .await
            .is_err()
        {
            let err = Error::CycleTimeout(self.cycle_timeout);
            let skipped = plan.len() - report.refreshed.len() - report.failed.len();
            warn!(%err, skipped, "abandoning the rest of the refresh cycle");
            report.timed_out = true;
        }

        if report.refreshed.contains(&SENSORS) {
            self.update_efficiency();
        }
        if report.refreshed.contains(&DEVICE_INFO) {
            self.update_identity();
        }

        self.scheduler.lock().complete_cycle();
        report
    }

    async fn read_groups(&self, plan: &[&'static str], report: &mut CycleReport) {
        for &name in plan {
            let result = match self.map.group(name) {
                Ok(group) => self.read_group(group).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(count) => {
                    debug!(group = name, count, "group refreshed");
                    report.refreshed.push(name);
                }
                Err(err) => {
                    warn!(group = name, %err, "group refresh failed");
                    report.failed.push(name);
                }
            }
        }
    }

    /// Read every block of `group`; the store is only touched once all blocks arrived.
    async fn read_group(&self, group: &RegisterGroup) -> Result<usize> {
        let mut values = Vec::with_capacity(group.registers().len());

        for block in group.blocks() {
            let words = self
                .link
                .read_block(group.table, block.start, block.count)
                .await?;
            for register in &block.registers {
                let value = register
                    .decode(block.words_of(register, &words))
                    .map_err(|_| TransportError::ShortResponse {
                        expected: block.count,
                        got: words.len(),
                    })?;
                values.push((register.key, value));
            }
        }

        let count = values.len();
        for (key, value) in values {
            self.apply(group.name, key, value);
        }
        Ok(count)
    }

    async fn read_register(&self, group: &str, register: &Register) -> Result<Value> {
        let table = self.map.group(group)?.table;
        let count = register.word_count();
        let words = self.link.read_block(table, register.addr, count).await?;
        let value = words
            .get(..usize::from(count))
            .ok_or(TransportError::ShortResponse {
                expected: count,
                got: words.len(),
            })
            .and_then(|words| {
                register
                    .decode(words)
                    .map_err(|_| TransportError::ShortResponse {
                        expected: count,
                        got: words.len(),
                    })
            })?;

        self.apply(group, register.key, value.clone());
        Ok(value)
    }

    /// Store `value` and publish it if it changed.
    fn apply(&self, group: &str, key: &str, value: Value) -> bool {
        let changed = match self.store.write().set(group, key, value.clone()) {
            Ok(changed) => changed,
            Err(err) => {
                warn!(%err, %value, "discarding value of unexpected kind");
                return false;
            }
        };

        if changed {
            debug!(group, key, %value, "datapoint changed");
            // No receivers is fine.
            let _ = self.changes.send(DatapointChange {
                group: group.to_string(),
                key: key.to_string(),
                value,
            });
        }
        changed
    }

    fn firmware_known(&self) -> bool {
        self.store
            .read()
            .get(DEVICE_INFO, FW_MAJOR)
            .as_f64()
            .is_some_and(|major| major != 0.0)
    }

    fn update_identity(&self) {
        let identity = {
            let store = self.store.read();
            let part = |key: &str| store.get(DEVICE_INFO, key).as_f64().unwrap_or(0.0) as u32;
            let text = |key: &str| {
                store
                    .get(DEVICE_INFO, key)
                    .as_text()
                    .unwrap_or_default()
                    .to_string()
            };
            if part(FW_MAJOR) == 0 {
                return;
            }
            DeviceIdentity {
                model: text(MODEL),
                serial: text(SERIAL),
                firmware: format!("{}.{}.{}", part(FW_MAJOR), part(FW_MINOR), part(FW_BUILD)),
            }
        };

        let mut current = self.identity.write();
        if current.as_ref() != Some(&identity) {
            info!(
                model = %identity.model,
                serial = %identity.serial,
                firmware = %identity.firmware,
                "unit identified"
            );
            *current = Some(identity);
        }
    }

    /// Heat recovery temperature efficiency from the latest sensor readings.
    fn update_efficiency(&self) {
        let (fresh, supply, extract) = {
            let store = self.store.read();
            (
                store.get(SENSORS, FRESH_TEMP).as_f64(),
                store.get(SENSORS, SUPPLY_TEMP_BEFORE_REHEATER).as_f64(),
                store.get(SENSORS, EXTRACT_TEMP).as_f64(),
            )
        };
        let (Some(fresh), Some(supply), Some(extract)) = (fresh, supply, extract) else {
            return;
        };

        let span = extract - fresh;
        if span.abs() < MIN_EFFICIENCY_SPAN {
            return;
        }
        let efficiency = ((supply - fresh) / span * 100.0).clamp(0.0, 100.0).round();
        self.apply(VIRTUAL_SENSORS, EFFICIENCY, Value::Numeric(efficiency));
    }

    /// Poll forever: refresh, then sleep the scheduler interval.
    ///
    /// A write cuts the sleep short so the fast interval applies at once.
    pub async fn run(&self) {
        if let Err(err) = self.link.connect().await {
            warn!(%err, "unit not reachable yet");
        }

        loop {
            let report = self.refresh_cycle().await;
            debug!(
                refreshed = report.refreshed.len(),
                failed = report.failed.len(),
                timed_out = report.timed_out,
                "refresh cycle done"
            );

            loop {
                let interval = self.poll_interval();
                tokio::select! {
                    _ = sleep(interval) => break,
                    _ = self.wake.notified() => continue,
                }
            }
        }
    }
}

impl<L: RegisterLink + 'static> DeviceCoordinator<L> {
    /// Spawn [`Self::run`] on the runtime. Abort the handle to stop polling.
    pub fn spawn_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run().await })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::codec::{ascii_to_words, Address, Quantity, Word};
    use crate::registers::{Cadence, Encoding, COMMANDS, SETPOINTS, UNIT_STATUSES};
    use crate::transport::fake_unit::{Event, FakeUnit};

    /// In-memory unit with injectable failures.
    #[derive(Default)]
    struct ScriptedLink {
        registers: Mutex<HashMap<(Table, Address), Word>>,
        failing: Mutex<HashSet<Address>>,
        stalling: Mutex<HashSet<Address>>,
        reject_writes: Mutex<bool>,
        reads: Mutex<Vec<Address>>,
        writes: Mutex<Vec<(Address, Word)>>,
    }

    impl ScriptedLink {
        fn set(&self, table: Table, addr: Address, words: &[Word]) {
            let mut registers = self.registers.lock();
            for (i, word) in words.iter().enumerate() {
                registers.insert((table, addr + i as Address), *word);
            }
        }

        fn fail(&self, addr: Address) {
            self.failing.lock().insert(addr);
        }

        fn heal(&self, addr: Address) {
            self.failing.lock().remove(&addr);
        }

        fn take_reads(&self) -> Vec<Address> {
            std::mem::take(&mut *self.reads.lock())
        }
    }

    #[async_trait]
    impl RegisterLink for ScriptedLink {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn read_block(
            &self,
            table: Table,
            start: Address,
            count: Quantity,
        ) -> Result<Vec<Word>, TransportError> {
            self.reads.lock().push(start);
            let stall = self.stalling.lock().contains(&start);
            if stall {
                sleep(Duration::from_secs(30)).await;
            }
            if self.failing.lock().contains(&start) {
                return Err(TransportError::Request("injected failure".to_string()));
            }
            let registers = self.registers.lock();
            Ok((start..start + count)
                .map(|addr| registers.get(&(table, addr)).copied().unwrap_or(0))
                .collect())
        }

        async fn write_register(&self, addr: Address, word: Word) -> Result<(), TransportError> {
            self.writes.lock().push((addr, word));
            if *self.reject_writes.lock() {
                return Err(TransportError::Exception("IllegalDataValue".to_string()));
            }
            self.registers.lock().insert((Table::Holding, addr), word);
            Ok(())
        }
    }

    fn casa_link() -> ScriptedLink {
        let link = ScriptedLink::default();
        link.set(Table::Input, 6000, &[1, 4, 12]);
        link.set(Table::Input, 6003, &ascii_to_words("CASA R5H", 8));
        link.set(Table::Input, 6011, &ascii_to_words("SN12345678", 8));
        link.set(Table::Input, 6200, &[185, 195, 200, 210]);
        link.set(Table::Input, 6300, &[50, 48, 0]);
        link.set(Table::Holding, 5100, &[205]);
        link
    }

    fn coordinator(link: ScriptedLink) -> DeviceCoordinator<ScriptedLink> {
        let scheduler = PollScheduler::new(Duration::from_secs(300), Duration::from_secs(5));
        DeviceCoordinator::new(RegisterMap::casa(), link, scheduler)
    }

    fn start_of(coordinator: &DeviceCoordinator<ScriptedLink>, group: &str) -> Address {
        coordinator.register_map().group(group).unwrap().blocks()[0].start
    }

    #[tokio::test]
    async fn test_unread_values_are_unknown() {
        let coordinator = coordinator(casa_link());
        assert_eq!(coordinator.get_value(SENSORS, FRESH_TEMP), Value::Unknown);
        assert_eq!(coordinator.get_value(COMMANDS, "Op_Mode"), Value::Unknown);
        assert_eq!(coordinator.get_value("Nope", "Nope"), Value::Unknown);
        assert!(coordinator.device_identity().is_none());
    }

    #[tokio::test]
    async fn test_refresh_populates_store() {
        let coordinator = coordinator(casa_link());
        let report = coordinator.refresh_cycle().await;

        assert!(report.failed.is_empty());
        assert!(!report.timed_out);
        assert_eq!(coordinator.get_value(SENSORS, FRESH_TEMP), Value::Numeric(18.5));
        assert_eq!(coordinator.get_value(SETPOINTS, "Temp_SP"), Value::Numeric(20.5));
        assert_eq!(coordinator.get_value(COMMANDS, "Op_Mode"), Value::EnumIndex(0));
        assert_eq!(coordinator.get_value(UNIT_STATUSES, "Supply_Fan"), Value::Numeric(50.0));
        assert!(coordinator
            .datapoint(SENSORS, FRESH_TEMP)
            .unwrap()
            .updated_at
            .is_some());
        // Config is only read on demand.
        assert_eq!(coordinator.get_value(CONFIG, "Boost_Run_Time"), Value::Unknown);
    }

    #[tokio::test]
    async fn test_device_info_read_once() {
        let coordinator = coordinator(casa_link());
        let info = start_of(&coordinator, DEVICE_INFO);

        let report = coordinator.refresh_cycle().await;
        assert!(report.planned.contains(&DEVICE_INFO));
        assert!(coordinator.link().take_reads().contains(&info));

        let report = coordinator.refresh_cycle().await;
        assert!(!report.planned.contains(&DEVICE_INFO));
        assert!(!coordinator.link().take_reads().contains(&info));

        assert_eq!(coordinator.model_name().as_deref(), Some("CASA R5H"));
        assert_eq!(coordinator.serial_number().as_deref(), Some("SN12345678"));
        assert_eq!(coordinator.firmware_version().as_deref(), Some("1.4.12"));
    }

    #[tokio::test]
    async fn test_device_info_retried_while_firmware_unknown() {
        let link = casa_link();
        link.fail(6000);
        let coordinator = coordinator(link).with_fallback_model("CASA R4");

        let report = coordinator.refresh_cycle().await;
        assert_eq!(report.failed, vec![DEVICE_INFO]);
        assert_eq!(coordinator.model_name().as_deref(), Some("CASA R4"));
        assert!(coordinator.serial_number().is_none());

        coordinator.link().heal(6000);
        let report = coordinator.refresh_cycle().await;
        assert!(report.refreshed.contains(&DEVICE_INFO));
        assert_eq!(coordinator.model_name().as_deref(), Some("CASA R5H"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setpoints_every_three_hours() {
        let coordinator = coordinator(casa_link());
        let setpoints = start_of(&coordinator, SETPOINTS);

        coordinator.refresh_cycle().await;
        assert!(coordinator.link().take_reads().contains(&setpoints));

        tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
        coordinator.refresh_cycle().await;
        assert!(!coordinator.link().take_reads().contains(&setpoints));

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        coordinator.refresh_cycle().await;
        assert!(coordinator.link().take_reads().contains(&setpoints));
    }

    #[tokio::test]
    async fn test_failing_group_is_contained() {
        let link = casa_link();
        link.fail(6100);
        let coordinator = coordinator(link);

        let report = coordinator.refresh_cycle().await;
        assert_eq!(report.failed, vec![ALARMS]);
        for group in [SENSORS, COMMANDS, UNIT_STATUSES] {
            assert!(report.refreshed.contains(&group), "{group} not refreshed");
        }
        let reads = coordinator.link().take_reads();
        assert!(reads.contains(&6100));
        assert!(reads.contains(&start_of(&coordinator, UNIT_STATUSES)));
        assert_eq!(coordinator.get_value(ALARMS, ACTIVE_ALARMS), Value::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_guard_skips_remaining_groups() {
        let link = casa_link();
        link.stalling.lock().insert(6200);
        let coordinator = coordinator(link);

        let report = coordinator.refresh_cycle().await;
        assert!(report.timed_out);
        assert!(report.refreshed.contains(&ALARMS));
        assert!(!report.refreshed.contains(&SENSORS));
        assert!(!coordinator
            .link()
            .take_reads()
            .contains(&start_of(&coordinator, UNIT_STATUSES)));

        // The next cycle runs normally.
        coordinator.link().stalling.lock().clear();
        let report = coordinator.refresh_cycle().await;
        assert!(!report.timed_out);
        assert!(report.refreshed.contains(&SENSORS));
    }

    #[tokio::test]
    async fn test_write_is_visible_immediately() {
        let coordinator = coordinator(casa_link());
        coordinator
            .write_value(COMMANDS, "Fireplace_Mode", true)
            .await
            .unwrap();
        assert_eq!(
            coordinator.get_value(COMMANDS, "Fireplace_Mode"),
            Value::Boolean(true)
        );
        assert_eq!(*coordinator.link().writes.lock(), vec![(5001, 1)]);

        // A failing refresh keeps the written value.
        coordinator.link().fail(5000);
        coordinator.refresh_cycle().await;
        assert_eq!(
            coordinator.get_value(COMMANDS, "Fireplace_Mode"),
            Value::Boolean(true)
        );
    }

    #[tokio::test]
    async fn test_scaled_write() {
        let coordinator = coordinator(casa_link());
        coordinator
            .write_value(SETPOINTS, "Temp_SP", 21.5)
            .await
            .unwrap();
        assert_eq!(*coordinator.link().writes.lock(), vec![(5100, 215)]);
        assert_eq!(coordinator.get_value(SETPOINTS, "Temp_SP"), Value::Numeric(21.5));
    }

    #[tokio::test]
    async fn test_failed_write_still_polls_fast() {
        let link = casa_link();
        *link.reject_writes.lock() = true;
        let coordinator = coordinator(link);

        let err = coordinator
            .write_value(COMMANDS, "Op_Mode", Value::EnumIndex(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Write { .. }), "{err:?}");
        assert_eq!(coordinator.get_value(COMMANDS, "Op_Mode"), Value::Unknown);
        assert_eq!(coordinator.poll_mode(), PollMode::Fast);
        assert_eq!(coordinator.fast_ticks(), 0);
    }

    #[tokio::test]
    async fn test_rejected_writes() {
        let coordinator = coordinator(casa_link());

        let err = coordinator
            .write_value(COMMANDS, "Nope", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(coordinator.poll_mode(), PollMode::Fast);

        let err = coordinator
            .write_value(SENSORS, FRESH_TEMP, 20.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));

        let err = coordinator
            .write_value(COMMANDS, "Fireplace_Mode", 0.5)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: ValueKind::Boolean,
                ..
            }
        ));

        let err = coordinator
            .write_value(COMMANDS, "Op_Mode", 7)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange { value, max, .. } if value == 7.0 && max == 4.0
        ));

        let err = coordinator
            .write_value(SETPOINTS, "Temp_SP", 30.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { max, .. } if max == 25.0));

        assert!(coordinator.link().writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_write_waits_for_stalled_refresh() {
        let unit = FakeUnit::start(0, Some((6200, Duration::from_millis(300)))).await;
        let link = ModbusTransport::new("127.0.0.1", unit.port, 1, Duration::from_secs(2));
        let scheduler = PollScheduler::new(Duration::from_secs(300), Duration::from_secs(5));
        let coordinator = Arc::new(DeviceCoordinator::new(RegisterMap::casa(), link, scheduler));

        let refresh = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh_cycle().await }
        });
        timeout(Duration::from_secs(5), async {
            while !unit.events().contains(&Event::Received(4, 6200)) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        coordinator
            .write_value(COMMANDS, "Fireplace_Mode", true)
            .await
            .unwrap();
        let report = refresh.await.unwrap();
        assert!(report.failed.is_empty(), "{report:?}");

        let events = unit.events();
        let position = |event: Event| events.iter().position(|e| *e == event).unwrap();
        let stalled = position(Event::Received(4, 6200));
        assert_eq!(position(Event::Answered(4, 6200)), stalled + 1);
        assert!(position(Event::Received(6, 5001)) > stalled + 1);
    }

    #[tokio::test]
    async fn test_integer_writes_are_coerced() {
        let coordinator = coordinator(casa_link());
        coordinator.write_value(COMMANDS, "Op_Mode", 3).await.unwrap();
        coordinator
            .write_value(COMMANDS, "Travelling_Mode", 0)
            .await
            .unwrap();

        assert_eq!(
            *coordinator.link().writes.lock(),
            vec![(5000, 3), (5002, 0)]
        );
        assert_eq!(
            coordinator.get_value(COMMANDS, "Op_Mode"),
            Value::EnumIndex(3)
        );
        assert_eq!(
            coordinator.get_value(COMMANDS, "Travelling_Mode"),
            Value::Boolean(false)
        );
    }

    #[tokio::test]
    async fn test_fast_poll_scenario() {
        let coordinator = coordinator(casa_link());

        let report = coordinator.refresh_cycle().await;
        assert!(report.planned.contains(&DEVICE_INFO));
        assert!(report.planned.contains(&SETPOINTS));
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(300));

        coordinator
            .write_value(COMMANDS, "Fireplace_Mode", 1)
            .await
            .unwrap();
        assert_eq!(*coordinator.link().writes.lock(), vec![(5001, 1)]);
        assert_eq!(
            coordinator.get_value(COMMANDS, "Fireplace_Mode"),
            Value::Boolean(true)
        );
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(5));
        assert_eq!(coordinator.fast_ticks(), 0);

        for _ in 0..5 {
            coordinator.refresh_cycle().await;
            assert_eq!(coordinator.poll_interval(), Duration::from_secs(5));
        }
        coordinator.refresh_cycle().await;
        assert_eq!(coordinator.poll_mode(), PollMode::Normal);
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_config_options_follow_group_order() {
        let config = RegisterGroup::new(
            CONFIG,
            Table::Holding,
            Cadence::OnDemand,
            vec![
                Register::new("Eco", "Eco", 10, Encoding::Signed).writable(),
                Register::new("Comfort", "Comfort", 11, Encoding::Signed).writable(),
                Register::new("Boost", "Boost", 12, Encoding::Signed).writable(),
            ],
        );
        let scheduler = PollScheduler::new(Duration::from_secs(300), Duration::from_secs(5));
        let coordinator = DeviceCoordinator::new(
            RegisterMap::new(vec![config]),
            ScriptedLink::default(),
            scheduler,
        );

        let options = coordinator.config_options();
        assert_eq!(
            options,
            BTreeMap::from([
                (0, "Eco".to_string()),
                (1, "Comfort".to_string()),
                (2, "Boost".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn test_select_config_notifies_subscriber() {
        let link = casa_link();
        link.set(Table::Holding, 5206, &[30]);
        let coordinator = coordinator(link);

        let selected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&selected);
        coordinator.register_update_callback(CONFIG_VALUE_SUBSCRIBER, move |key: &str| {
            sink.lock().push(key.to_string())
        });

        coordinator.select_config("Boost_Run_Time", 6).await.unwrap();
        assert_eq!(coordinator.config_selection(), 6);
        assert_eq!(coordinator.get_value(CONFIG, "Boost_Run_Time"), Value::Numeric(30.0));

        // Failure still moves the selection and notifies.
        coordinator.link().fail(5200);
        let err = coordinator.select_config("Away_Supply_Fan", 0).await.unwrap_err();
        assert!(matches!(err, Error::Communication(_)));
        assert_eq!(coordinator.config_selection(), 0);
        assert_eq!(*selected.lock(), vec!["Boost_Run_Time", "Away_Supply_Fan"]);

        assert!(matches!(
            coordinator.select_config("Nope", 1).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_callback_registration_replaces() {
        let coordinator = coordinator(casa_link());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        coordinator.register_update_callback(CONFIG_VALUE_SUBSCRIBER, move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&second);
        coordinator.register_update_callback(CONFIG_VALUE_SUBSCRIBER, move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.select_config("Home_Supply_Fan", 2).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let coordinator = coordinator(casa_link());
        let mut changes = coordinator.subscribe();

        coordinator.refresh_cycle().await;
        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push((change.group, change.key, change.value));
        }
        assert!(seen.contains(&(
            SENSORS.to_string(),
            FRESH_TEMP.to_string(),
            Value::Numeric(18.5)
        )));

        // Unchanged values are not published again.
        coordinator.link().take_reads();
        coordinator.refresh_cycle().await;
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_efficiency_and_alarms() {
        let link = casa_link();
        link.set(Table::Input, 6200, &[0, 160]);
        link.set(Table::Input, 6203, &[200]);
        link.set(Table::Input, 6100, &[1, 1, 0, 0, 0, 0, 1]);
        let coordinator = coordinator(link);

        coordinator.refresh_cycle().await;
        assert_eq!(
            coordinator.get_value(VIRTUAL_SENSORS, EFFICIENCY),
            Value::Numeric(80.0)
        );
        assert_eq!(
            coordinator.active_alarms(),
            vec!["Filter_Alarm".to_string(), "Sensor_Alarm".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_wakes_polling_loop() {
        let coordinator = Arc::new(coordinator(casa_link()));
        let alarms = start_of(&coordinator, ALARMS);
        let cycles = |coordinator: &DeviceCoordinator<ScriptedLink>| {
            coordinator
                .link()
                .reads
                .lock()
                .iter()
                .filter(|addr| **addr == alarms)
                .count()
        };

        let handle = coordinator.spawn_polling();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cycles(coordinator.as_ref()), 1);

        coordinator
            .write_value(COMMANDS, "Travelling_Mode", true)
            .await
            .unwrap();
        sleep(Duration::from_secs(6)).await;
        assert_eq!(cycles(coordinator.as_ref()), 2);

        handle.abort();
    }
}
