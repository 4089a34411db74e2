//! Connection engine
//!
//! Fan-out/fan-in coordinator for the fleet. All state lives in one
//! place and every transition happens on the event loop: connection
//! attempts, notifications, timeouts and cool-downs arrive as events on
//! a single channel and are handled synchronously. Per-vehicle epoch
//! counters stamp every spawned task and timer so events from aborted
//! attempts are recognized as stale and dropped.
//!
//! An attempt holds its adapter exclusively from socket open until GATT
//! reports ready; the adapter is released at ready so the next vehicle
//! can start while characteristic discovery is still running.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use anki_transport::att::LinkEvent;
use anki_transport::message;
use anki_transport::{BleHost, LinkError, LinkProfile, VehicleLink};
use tokio::sync::mpsc;
use tracing::debug;

use crate::observer::FleetObserver;
use crate::output::Output;
use crate::pool::AdapterPool;
use crate::registry::VehicleRegistry;
use crate::vehicle::ConnectionState;

/// Budget for socket open through GATT ready.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Adapter cool-down after a timed-out attempt.
const ADAPTER_COOLDOWN: Duration = Duration::from_millis(50);
/// Poll interval for the latency worker's result.
const LATENCY_POLL: Duration = Duration::from_millis(250);
/// Target connection interval: 16 × 1.25 ms = 20 ms.
const CONN_INTERVAL_SLOTS: u16 = 16;

/// Everything that can wake the engine.
pub enum Event {
    /// Re-examine the queue of vehicles that should connect.
    Continuation,
    /// Socket + ATT + GATT bring-up finished (the adapter-exclusive
    /// window); the link stays with the connect task for configure.
    EstablishDone {
        vehicle: usize,
        epoch: u64,
        result: Result<(), LinkError>,
    },
    /// Characteristic walk + notification enablement finished.
    ConfigureDone {
        vehicle: usize,
        epoch: u64,
        result: Result<(Box<dyn VehicleLink>, LinkProfile), LinkError>,
    },
    /// Notification or disconnect from a live link.
    Link {
        vehicle: usize,
        epoch: u64,
        event: LinkEvent,
    },
    /// A post-failure adapter cool-down ran out.
    CooldownExpired { adapter: usize },
    /// The latency worker reported back (0 or a raw OS error).
    LatencyResult {
        vehicle: usize,
        epoch: u64,
        code: i32,
    },
}

/// Gate the shell waits on while connection attempts are pending.
#[derive(Clone)]
pub struct InputGate {
    accepting: Rc<Cell<bool>>,
    notify: Rc<tokio::sync::Notify>,
}

impl Default for InputGate {
    fn default() -> Self {
        Self {
            accepting: Rc::new(Cell::new(true)),
            notify: Rc::new(tokio::sync::Notify::new()),
        }
    }
}

impl InputGate {
    pub fn disable(&self) {
        self.accepting.set(false);
    }

    pub fn enable(&self) {
        self.accepting.set(true);
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.accepting.get()
    }

    pub async fn wait_open(&self) {
        loop {
            let notified = self.notify.notified();
            if self.accepting.get() {
                return;
            }
            notified.await;
        }
    }
}

pub type EngineHandle = Rc<RefCell<Engine>>;

pub struct Engine {
    pool: AdapterPool,
    registry: VehicleRegistry,
    host: Rc<dyn BleHost>,
    out: Output,
    observer: Box<dyn FleetObserver>,
    events_tx: mpsc::UnboundedSender<Event>,
    gate: InputGate,
    active_cooldowns: usize,
}

impl Engine {
    pub fn new(
        host: Rc<dyn BleHost>,
        out: Output,
        observer: Box<dyn FleetObserver>,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<Event>, InputGate) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = InputGate::default();
        let engine = Engine {
            pool: AdapterPool::new(),
            registry: VehicleRegistry::new(),
            host,
            out,
            observer,
            events_tx,
            gate: gate.clone(),
            active_cooldowns: 0,
        };
        (Rc::new(RefCell::new(engine)), events_rx, gate)
    }

    pub fn pool(&self) -> &AdapterPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut AdapterPool {
        &mut self.pool
    }

    pub fn registry(&self) -> &VehicleRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut VehicleRegistry {
        &mut self.registry
    }

    pub fn output(&self) -> &Output {
        &self.out
    }

    /// Schedule an engine tick.
    pub fn poke(&self) {
        let _ = self.events_tx.send(Event::Continuation);
    }

    /// Whether connect attempts, cool-downs or latency polls are still
    /// in flight; the test harness drains until this clears.
    pub fn has_pending_work(&self) -> bool {
        self.active_cooldowns > 0
            || self.registry.iter().any(|v| {
                let connecting = v
                    .tasks
                    .connect
                    .as_ref()
                    .is_some_and(|t| !t.is_finished());
                let polling = v
                    .tasks
                    .latency
                    .as_ref()
                    .is_some_and(|t| !t.is_finished());
                connecting || polling
            })
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Continuation => self.tick(),
            Event::EstablishDone {
                vehicle,
                epoch,
                result,
            } => self.on_establish_done(vehicle, epoch, result),
            Event::ConfigureDone {
                vehicle,
                epoch,
                result,
            } => self.on_configure_done(vehicle, epoch, result),
            Event::Link {
                vehicle,
                epoch,
                event,
            } => self.on_link_event(vehicle, epoch, event),
            Event::CooldownExpired { adapter } => self.on_cooldown_expired(adapter),
            Event::LatencyResult {
                vehicle,
                epoch,
                code,
            } => self.on_latency_result(vehicle, epoch, code),
        }
    }

    fn is_current(&self, vehicle: usize, epoch: u64) -> bool {
        self.registry
            .get(vehicle)
            .map(|v| v.epoch == epoch)
            .unwrap_or(false)
    }

    // ========================================================================
    // Queue handling
    // ========================================================================

    /// Request a connection. Answers true for every state in which the
    /// vehicle is or will be connected — a vehicle already queued in
    /// `ShouldConnect` reports success without starting a new attempt.
    pub fn connect(&mut self, index: usize, max_tries: usize, add_to_wait_list: bool) -> bool {
        let Some(vehicle) = self.registry.get_mut(index) else {
            return false;
        };
        match vehicle.state {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::ShouldConnect => return true,
            ConnectionState::Disconnecting => return false,
            ConnectionState::Disconnected => {}
        }

        vehicle.state = ConnectionState::ShouldConnect;
        vehicle.on_wait_list = add_to_wait_list;
        vehicle.tries = 0;
        vehicle.max_tries = max_tries;
        let address = vehicle.address;
        if add_to_wait_list {
            self.registry.add_to_wait_list(address);
        }
        self.poke();
        true
    }

    /// One pass of the connection queue.
    fn tick(&mut self) {
        let Some(index) = self.registry.next_should_connect() else {
            self.finish_pending_if_done(true);
            return;
        };

        match self.pool.pick_free() {
            Some(adapter) => self.connect_now(index, adapter),
            None => {
                if self.pool.pick_free_including_blocked().is_none() {
                    // Not a transient block: the pool is empty or every
                    // adapter is saturated by live connections.
                    if self.pool.is_empty() {
                        self.out.error(
                            "No HCI devices available. Giving up on pending connections.",
                        );
                    } else {
                        self.out.error(
                            "All HCI devices already have the maximum number of established connections. Giving up on pending connections.",
                        );
                    }
                    while let Some(next) = self.registry.next_should_connect() {
                        self.disconnect(next);
                    }
                    self.finish_pending_if_done(false);
                } else {
                    debug!("all adapters transiently blocked, waiting for cool-down");
                }
            }
        }
    }

    /// Re-enable shell input once nothing is pending; optionally with
    /// the all-connected announcement.
    fn finish_pending_if_done(&mut self, announce: bool) {
        if self.registry.is_waiting_for_pending() && self.registry.wait_list_is_empty() {
            if announce {
                self.out.success("All vehicles connected.");
            }
            self.registry.set_waiting_for_pending(false);
            self.gate.enable();
        }
    }

    /// Begin an attempt. Only the tick calls this; the tick guarantees
    /// the adapter is free and unblocked.
    fn connect_now(&mut self, index: usize, adapter: usize) {
        let dev_id = self.pool.get(adapter).dev_id;
        let adapter_address = self.pool.get(adapter).address;
        let events_tx = self.events_tx.clone();
        let host = Rc::clone(&self.host);

        let vehicle = self
            .registry
            .get_mut(index)
            .expect("tick produced an invalid index");
        debug_assert_eq!(vehicle.state, ConnectionState::ShouldConnect);
        if let Err(problems) = vehicle.validate_idle_state() {
            for problem in problems {
                self.out.error(format!(
                    "Connection state of {} is tainted: {problem}",
                    vehicle.name
                ));
            }
        }

        vehicle.state = ConnectionState::Connecting;
        vehicle.tries += 1;
        vehicle.adapter = Some(adapter);
        vehicle.blocking_adapter = true;
        let target = vehicle.address;
        let epoch = vehicle.epoch;
        let name = vehicle.name.clone();

        self.pool.add_user(adapter);
        self.pool.block(adapter);
        self.out
            .line(format!("Connecting to {name} (using hci{dev_id})..."));

        let task = tokio::task::spawn_local(async move {
            let outcome =
                tokio::time::timeout(CONNECT_TIMEOUT, host.establish(dev_id, adapter_address, target))
                    .await;
            let mut link = match outcome {
                Err(_) => {
                    let _ = events_tx.send(Event::EstablishDone {
                        vehicle: index,
                        epoch,
                        result: Err(LinkError::ConnectTimeout),
                    });
                    return;
                }
                Ok(Err(e)) => {
                    let _ = events_tx.send(Event::EstablishDone {
                        vehicle: index,
                        epoch,
                        result: Err(e),
                    });
                    return;
                }
                Ok(Ok(link)) => link,
            };
            let _ = events_tx.send(Event::EstablishDone {
                vehicle: index,
                epoch,
                result: Ok(()),
            });

            let result = link.configure().await.map(|profile| (link, profile));
            let _ = events_tx.send(Event::ConfigureDone {
                vehicle: index,
                epoch,
                result,
            });
        });
        if let Some(vehicle) = self.registry.get_mut(index) {
            vehicle.tasks.connect = Some(task);
        }
    }

    // ========================================================================
    // Bring-up results
    // ========================================================================

    fn on_establish_done(&mut self, index: usize, epoch: u64, result: Result<(), LinkError>) {
        if !self.is_current(index, epoch) {
            debug!(vehicle = index, "dropping stale establish result");
            return;
        }
        let vehicle = self.registry.get_mut(index).expect("validated index");
        if vehicle.state != ConnectionState::Connecting {
            return;
        }
        let name = vehicle.name.clone();
        let adapter = vehicle.adapter;

        match result {
            Ok(()) => {
                // GATT is ready: release the adapter so the next
                // vehicle can start while configure continues.
                if vehicle.blocking_adapter {
                    vehicle.blocking_adapter = false;
                    if let Some(adapter) = adapter {
                        self.pool.unblock(adapter);
                    }
                }
                self.poke();
            }
            Err(LinkError::Busy) => {
                vehicle.tasks.connect = None;
                self.disconnect(index);
                self.out.warning(format!(
                    "Trying to disrupt existing connection to {name}..."
                ));
                let target = self
                    .registry
                    .get(index)
                    .map(|v| v.address)
                    .expect("validated index");
                match self.host.preempt_alien(target) {
                    Ok(()) => {
                        self.out
                            .success(format!("Disrupted alien connection of {name}."));
                        self.continue_connection(index, true);
                    }
                    Err(e) => {
                        self.out
                            .error(format!("Failed to disrupt alien connection of {name}: {e}."));
                        self.continue_connection(index, false);
                    }
                }
            }
            Err(LinkError::ConnectTimeout) => {
                vehicle.tasks.connect = None;
                self.out.warning(format!(
                    "Aborting attempt to connect socket of {name} since it is taking too long."
                ));
                self.disconnect(index);
                if let Some(adapter) = adapter {
                    // Give the dongle 50 ms to recover, preventing
                    // EBUSY on the next attempt.
                    self.start_cooldown(adapter);
                }
                self.continue_connection(index, true);
            }
            Err(LinkError::Socket(e)) => {
                vehicle.tasks.connect = None;
                self.out
                    .error(format!("Failed to connect socket of {name}: {e}."));
                self.disconnect(index);
                self.continue_connection(index, true);
            }
            Err(e) => {
                vehicle.tasks.connect = None;
                let recoverable = e.is_recoverable();
                self.out.error(format!("Failed to connect to {name}: {e}."));
                self.disconnect(index);
                self.continue_connection(index, recoverable);
            }
        }
    }

    fn on_configure_done(
        &mut self,
        index: usize,
        epoch: u64,
        result: Result<(Box<dyn VehicleLink>, LinkProfile), LinkError>,
    ) {
        if !self.is_current(index, epoch) {
            debug!(vehicle = index, "dropping stale configure result");
            return;
        }
        let vehicle = self.registry.get_mut(index).expect("validated index");
        if vehicle.state != ConnectionState::Connecting {
            return;
        }
        vehicle.tasks.connect = None;
        let name = vehicle.name.clone();

        let (mut link, profile) = match result {
            Ok(ok) => ok,
            Err(e) => {
                match &e {
                    LinkError::MissingCharacteristics => self.out.error(format!(
                        "Failed to determine read and write characteristics of {name}."
                    )),
                    LinkError::CccdWrite(_) => self.out.error(format!(
                        "Failed to set notification bit in write characteristic of {name}."
                    )),
                    LinkError::NotifySubscribe(_) => self
                        .out
                        .error(format!("Failed to register for notify event of {name}.")),
                    other => self
                        .out
                        .error(format!("Failed to connect to {name}: {other}.")),
                }
                let recoverable = e.is_recoverable();
                self.disconnect(index);
                self.continue_connection(index, recoverable);
                return;
            }
        };

        // Wire the link's event stream into the engine channel.
        let events = link.take_events();
        let connection_id = self.registry.free_connection_id();
        let vehicle = self.registry.get_mut(index).expect("validated index");
        vehicle.link = Some(link);
        vehicle.profile = Some(profile);
        vehicle.connection_id = connection_id;
        vehicle.state = ConnectionState::Connected;
        let address = vehicle.address;
        if vehicle.on_wait_list {
            vehicle.on_wait_list = false;
            self.registry.remove_from_wait_list(address);
        }
        self.out.success(format!("Connected to {name}."));

        if let Some(mut events) = events {
            let events_tx = self.events_tx.clone();
            let task = tokio::task::spawn_local(async move {
                while let Some(event) = events.recv().await {
                    if events_tx
                        .send(Event::Link {
                            vehicle: index,
                            epoch,
                            event,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            if let Some(vehicle) = self.registry.get_mut(index) {
                vehicle.tasks.forwarder = Some(task);
            }
        }

        self.start_latency_update(index, epoch);

        // Fresh connections are stationary: brake lights on, then the
        // vendor hello, SDK mode and the default track config.
        let vehicle = self.registry.get_mut(index).expect("validated index");
        vehicle.request_version(true);
        vehicle.set_braking_lights_on();
        let hello = message::hello();
        vehicle.send_to_vehicle(&hello, false);
        vehicle.set_sdk_mode(1);
        vehicle.set_default_config();

        self.poke();
    }

    /// Kick the connection interval down to 20 ms on a worker thread
    /// and poll for its verdict from the loop.
    fn start_latency_update(&mut self, index: usize, epoch: u64) {
        let Some(vehicle) = self.registry.get_mut(index) else {
            return;
        };
        let Some(link) = vehicle.link.as_ref() else {
            return;
        };
        let result_rx = link.request_conn_interval(CONN_INTERVAL_SLOTS);
        let events_tx = self.events_tx.clone();
        let task = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(LATENCY_POLL).await;
                match result_rx.try_recv() {
                    Ok(code) => {
                        let _ = events_tx.send(Event::LatencyResult {
                            vehicle: index,
                            epoch,
                            code,
                        });
                        return;
                    }
                    Err(std::sync::mpsc::TryRecvError::Empty) => continue,
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
                }
            }
        });
        vehicle.tasks.latency = Some(task);
    }

    fn on_latency_result(&mut self, index: usize, epoch: u64, code: i32) {
        if !self.is_current(index, epoch) {
            return;
        }
        let Some(vehicle) = self.registry.get_mut(index) else {
            return;
        };
        vehicle.tasks.latency = None;
        if code != 0 {
            let err = std::io::Error::from_raw_os_error(code);
            let name = vehicle.name.clone();
            self.out
                .error(format!("Failed to set latency of {name}: {err}."));
        }
    }

    fn on_link_event(&mut self, index: usize, epoch: u64, event: LinkEvent) {
        if !self.is_current(index, epoch) {
            debug!(vehicle = index, "dropping stale link event");
            return;
        }
        match event {
            LinkEvent::Notification(bytes) => {
                let Self {
                    registry,
                    observer,
                    out,
                    ..
                } = self;
                if let Some(vehicle) = registry.get_mut(index) {
                    vehicle.on_message(&bytes, out, observer.as_mut());
                }
            }
            LinkEvent::Disconnected(reason) => {
                if let Some(vehicle) = self.registry.get(index) {
                    let name = vehicle.name.clone();
                    self.out
                        .error(format!("ATT layer of {name} disconnected: {reason}."));
                }
                self.disconnect(index);
            }
        }
    }

    fn on_cooldown_expired(&mut self, adapter: usize) {
        self.active_cooldowns = self.active_cooldowns.saturating_sub(1);
        self.pool.unblock(adapter);
        self.tick();
    }

    fn start_cooldown(&mut self, adapter: usize) {
        self.pool.block(adapter);
        self.active_cooldowns += 1;
        let events_tx = self.events_tx.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(ADAPTER_COOLDOWN).await;
            let _ = events_tx.send(Event::CooldownExpired { adapter });
        });
    }

    // ========================================================================
    // Retry policy and teardown
    // ========================================================================

    /// Decide between another attempt and giving up, then reschedule
    /// the queue. Mirrors the teardown-then-retry flow: the vehicle
    /// must already be back in `Disconnected`.
    fn continue_connection(&mut self, index: usize, retry: bool) {
        let Some(vehicle) = self.registry.get_mut(index) else {
            return;
        };
        if vehicle.state == ConnectionState::Disconnected {
            let name = vehicle.name.clone();
            if retry {
                if vehicle.tries < vehicle.max_tries || vehicle.max_tries == 0 {
                    if vehicle.max_tries == 0 {
                        self.out.warning(format!(
                            "Scheduling retry #{} (out of infinite retries) for connection to {name}.",
                            vehicle.tries
                        ));
                    } else {
                        self.out.warning(format!(
                            "Scheduling retry #{} (out of {} retries) for connection to {name}.",
                            vehicle.tries, vehicle.max_tries
                        ));
                    }
                    let address = vehicle.address;
                    let rejoin_wait_list = vehicle.on_wait_list;
                    vehicle.state = ConnectionState::ShouldConnect;
                    if rejoin_wait_list {
                        self.registry.add_to_wait_list(address);
                    }
                } else {
                    self.out.error(format!(
                        "Giving up to connect to {name} after the maximum number of {} retries was reached.",
                        vehicle.max_tries
                    ));
                }
            } else {
                vehicle.tries = vehicle.max_tries;
                self.out.error(format!(
                    "Giving up to connect to {name} due to fatal connection error."
                ));
            }
        }
        self.poke();
    }

    /// Tear a vehicle down. Idempotent and safe from any state; ends in
    /// `Disconnected` with the idle-state validator passing.
    pub fn disconnect(&mut self, index: usize) {
        let Self {
            registry,
            pool,
            observer,
            out,
            ..
        } = self;
        let Some(vehicle) = registry.get_mut(index) else {
            return;
        };
        let state_before = vehicle.state;
        if state_before == ConnectionState::Disconnected {
            return;
        }

        vehicle.state = ConnectionState::Disconnecting;
        vehicle.epoch += 1;
        vehicle.tasks.abort_all();

        if let Some(adapter) = vehicle.adapter.take() {
            if vehicle.blocking_adapter {
                vehicle.blocking_adapter = false;
                pool.unblock(adapter);
            }
            pool.remove_user(adapter);
        }

        let address = vehicle.address;
        let on_wait_list = vehicle.on_wait_list;
        observer.on_disconnect(address);
        vehicle.reset_link_state();
        vehicle.state = ConnectionState::Disconnected;
        let name = vehicle.name.clone();
        let validation = vehicle.validate_idle_state();

        // The wait-list membership goes, but the flag stays so a retry
        // re-joins the list.
        if on_wait_list {
            registry.remove_from_wait_list(address);
        }

        if let Err(problems) = validation {
            for problem in problems {
                out.error(format!("Teardown of {name} incomplete: {problem}"));
            }
            debug_assert!(false, "teardown left transient state behind");
        }

        if state_before == ConnectionState::Connected {
            out.success(format!("Disconnected from {name}."));
        }
    }

    /// Preempt a foreign connection to this vehicle's address. Refused
    /// while the vehicle itself holds or builds a connection.
    pub fn disrupt(&mut self, index: usize) -> bool {
        let Some(vehicle) = self.registry.get(index) else {
            return false;
        };
        if vehicle.link.is_some() || vehicle.is_connecting() {
            self.out.error(
                "Alien connections of connecting or connected vehicles cannot be disrupted.",
            );
            return false;
        }
        let name = vehicle.name.clone();
        let address = vehicle.address;
        match self.host.preempt_alien(address) {
            Ok(()) => {
                self.out
                    .success(format!("Disrupted alien connection of {name}."));
                true
            }
            Err(e) => {
                self.out
                    .error(format!("Failed to disrupt alien connection of {name}: {e}."));
                false
            }
        }
    }

    /// Graceful shutdown: ask every connected vehicle to hang up, then
    /// tear all records down and verify the pool drained.
    pub fn shutdown(&mut self) {
        for vehicle in self.registry.iter_mut() {
            vehicle.disconnect_politely();
        }
        for index in 0..self.registry.len() {
            self.disconnect(index);
        }
        debug_assert_eq!(self.pool.total_in_use(), 0);
    }

    /// Cross-record invariants, checked by tests after every drain.
    pub fn validate_invariants(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        for (index, adapter) in self.pool.iter().enumerate() {
            let bound = self
                .registry
                .iter()
                .filter(|v| v.adapter == Some(index))
                .count();
            if bound != adapter.in_use() {
                problems.push(format!(
                    "adapter hci{} counts {} users but {} vehicles are bound",
                    adapter.dev_id,
                    adapter.in_use(),
                    bound
                ));
            }
            if adapter.in_use() > adapter.max_in_use() {
                problems.push(format!("adapter hci{} exceeds its cap", adapter.dev_id));
            }
        }

        let mut seen_ids = std::collections::BTreeSet::new();
        for vehicle in self.registry.iter() {
            if vehicle.is_connected() {
                if let Some(id) = vehicle.connection_id {
                    if !seen_ids.insert(id) {
                        problems.push(format!("connection id {id} allocated twice"));
                    }
                }
            }
            if let Err(vehicle_problems) = vehicle.validate_idle_state() {
                for problem in vehicle_problems {
                    problems.push(format!("{}: {problem}", vehicle.name));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Pump engine events until every sender is gone.
pub async fn run(handle: EngineHandle, mut events_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events_rx.recv().await {
        handle.borrow_mut().handle_event(event);
    }
}
