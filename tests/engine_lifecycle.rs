//! Connection-engine lifecycle tests against a scripted mock BLE stack
//!
//! Each test drives the engine's event channel under a paused clock, so
//! the 5-second connect timeout and the 50 ms adapter cool-down elapse
//! virtually. After every drain the cross-record invariants are
//! checked: no adapter over capacity, no connection-id collisions, and
//! the teardown validator clean for every idle vehicle.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use anki_transport::att::LinkEvent;
use anki_transport::error::LinkError;
use anki_transport::types::{Address, VehicleModel};
use anki_transport::{BleHost, LinkProfile, VehicleLink};
use drive_fleet::engine::{Engine, EngineHandle, Event, InputGate};
use drive_fleet::observer::NullObserver;
use drive_fleet::output::Output;
use drive_fleet::vehicle::{ConnectionState, Vehicle};

// ============================================================================
// Mock host
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Establish and configure both succeed.
    Succeed,
    /// The kernel reports EBUSY synchronously.
    Busy,
    /// The connect never completes; the engine's timeout must fire.
    Hang,
    /// Socket-level failure after the connect was issued.
    SocketError,
    /// Establish succeeds but the vendor service is absent.
    MissingCharacteristics,
}

struct LinkState {
    address: Address,
    writes: RefCell<Vec<Vec<u8>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

struct MockLink {
    state: Rc<LinkState>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    configure_error: Option<LinkError>,
}

#[async_trait(?Send)]
impl VehicleLink for MockLink {
    async fn configure(&mut self) -> Result<LinkProfile, LinkError> {
        if let Some(error) = self.configure_error.take() {
            return Err(error);
        }
        Ok(LinkProfile {
            read_value_handle: 0x0e,
            write_value_handle: 0x0d,
            write_properties: 0x0c,
        })
    }

    fn write(&self, frame: &[u8]) -> bool {
        self.state.writes.borrow_mut().push(frame.to_vec());
        true
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    fn read_value(&self) {}

    fn request_conn_interval(&self, _slots: u16) -> std_mpsc::Receiver<i32> {
        let (tx, rx) = std_mpsc::channel();
        let _ = tx.send(0);
        rx
    }
}

#[derive(Default)]
struct MockHost {
    scripts: RefCell<HashMap<Address, VecDeque<Step>>>,
    links: RefCell<Vec<Rc<LinkState>>>,
    preempt_ok: Cell<bool>,
    preempt_count: Cell<usize>,
    establish_count: Cell<usize>,
}

impl MockHost {
    fn script(&self, address: Address, steps: &[Step]) {
        self.scripts
            .borrow_mut()
            .insert(address, steps.iter().copied().collect());
    }

    fn next_step(&self, address: Address) -> Step {
        self.scripts
            .borrow_mut()
            .get_mut(&address)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Step::Succeed)
    }

    fn link_for(&self, address: Address) -> Rc<LinkState> {
        self.links
            .borrow()
            .iter()
            .rev()
            .find(|l| l.address == address)
            .cloned()
            .expect("no link established for vehicle")
    }
}

#[async_trait(?Send)]
impl BleHost for MockHost {
    async fn establish(
        &self,
        _adapter_dev_id: u16,
        _adapter_address: Address,
        target: Address,
    ) -> Result<Box<dyn VehicleLink>, LinkError> {
        self.establish_count.set(self.establish_count.get() + 1);
        let step = self.next_step(target);
        match step {
            Step::Busy => Err(LinkError::Busy),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Step::SocketError => Err(LinkError::Socket(std::io::Error::from_raw_os_error(
                libc::ECONNREFUSED,
            ))),
            Step::Succeed | Step::MissingCharacteristics => {
                // A little radio time keeps the bring-up asynchronous.
                tokio::time::sleep(Duration::from_millis(30)).await;
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let state = Rc::new(LinkState {
                    address: target,
                    writes: RefCell::new(Vec::new()),
                    events_tx,
                });
                self.links.borrow_mut().push(Rc::clone(&state));
                Ok(Box::new(MockLink {
                    state,
                    events: Some(events_rx),
                    configure_error: (step == Step::MissingCharacteristics)
                        .then_some(LinkError::MissingCharacteristics),
                }))
            }
        }
    }

    fn preempt_alien(&self, _target: Address) -> Result<(), LinkError> {
        self.preempt_count.set(self.preempt_count.get() + 1);
        if self.preempt_ok.get() {
            Ok(())
        } else {
            Err(LinkError::PreemptFailed("no matching connection".into()))
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    host: Rc<MockHost>,
    engine: EngineHandle,
    events_rx: mpsc::UnboundedReceiver<Event>,
    gate: InputGate,
}

fn addr(last: u8) -> Address {
    Address::new([0xc9, 0x02, 0x3a, 0x7d, 0x1a, last])
}

fn harness(adapters: &[(u16, usize)], vehicles: usize) -> Harness {
    let host = Rc::new(MockHost::default());
    let (engine, events_rx, gate) = Engine::new(
        Rc::clone(&host) as Rc<dyn BleHost>,
        Output::new(),
        Box::new(NullObserver),
    );
    {
        let mut engine = engine.borrow_mut();
        for (index, &(dev_id, cap)) in adapters.iter().enumerate() {
            engine
                .pool_mut()
                .add(dev_id, Address::new([0x00, 0x1b, 0xdc, 0, 0, index as u8]), cap);
        }
        for i in 0..vehicles {
            engine.registry_mut().add(Vehicle::new(
                addr(i as u8),
                format!("CAR{i}"),
                VehicleModel::Kourai,
            ));
        }
    }
    Harness {
        host,
        engine,
        events_rx,
        gate,
    }
}

impl Harness {
    /// Process events until the engine has no attempts, cool-downs or
    /// latency polls in flight, then verify the invariants.
    async fn drain(&mut self) {
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.engine.borrow_mut().handle_event(event);
            }
            if !self.engine.borrow().has_pending_work() {
                break;
            }
            match self.events_rx.recv().await {
                Some(event) => self.engine.borrow_mut().handle_event(event),
                None => break,
            }
        }
        self.assert_invariants();
    }

    /// Let spawned forwarders run, then handle whatever they queued.
    async fn settle(&mut self) {
        for _ in 0..3 {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            while let Ok(event) = self.events_rx.try_recv() {
                self.engine.borrow_mut().handle_event(event);
            }
        }
        self.assert_invariants();
    }

    fn assert_invariants(&self) {
        if let Err(problems) = self.engine.borrow().validate_invariants() {
            panic!("invariants violated: {problems:?}");
        }
    }

    fn state(&self, index: usize) -> ConnectionState {
        self.engine.borrow().registry().get(index).unwrap().state
    }

    fn connected_count(&self) -> usize {
        self.engine.borrow().registry().connected_count()
    }

    fn adapter_in_use(&self, index: usize) -> usize {
        self.engine.borrow().pool().get(index).in_use()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fresh_connect_single_vehicle() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);

            assert!(h.engine.borrow_mut().connect(0, 3, true));
            assert!(!h.gate.is_open() || h.engine.borrow().registry().is_waiting_for_pending());
            h.gate.disable();

            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Connected);
            assert_eq!(h.adapter_in_use(0), 1);
            assert_eq!(
                h.engine.borrow().registry().get(0).unwrap().connection_id,
                Some(0)
            );
            assert!(h.gate.is_open(), "input re-enabled after the wait list drains");

            // Connected sequence: version request, brake lights on,
            // vendor hello, SDK mode. The config push is skipped until
            // a version response proves Overdrive firmware.
            let link = h.host.link_for(addr(0));
            let writes = link.writes.borrow().clone();
            assert_eq!(
                writes,
                vec![
                    vec![1, 0x18],
                    vec![2, 0x1d, 0x22],
                    vec![1, 0x0b],
                    vec![3, 0x90, 0x01, 0x01],
                ]
            );

            // Clean shutdown returns the adapter counter to zero.
            h.engine.borrow_mut().disconnect(0);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.adapter_in_use(0), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_true_when_already_queued() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            let mut engine = h.engine.borrow_mut();
            assert!(engine.connect(0, 3, false));
            // Still queued: reports success without a new attempt.
            assert!(engine.connect(0, 3, false));
            assert_eq!(
                engine.registry().get(0).unwrap().state,
                ConnectionState::ShouldConnect
            );
            drop(engine);

            h.drain().await;
            assert!(h.engine.borrow_mut().connect(0, 3, false));
            assert_eq!(h.state(0), ConnectionState::Connected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_saturated_adapter_gives_up_on_sixth_vehicle() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 6);

            {
                let mut engine = h.engine.borrow_mut();
                for i in 0..6 {
                    engine.connect(i, 3, true);
                }
            }
            h.gate.disable();
            h.drain().await;

            assert_eq!(h.connected_count(), 5);
            assert_eq!(h.adapter_in_use(0), 5);
            assert_eq!(h.state(5), ConnectionState::Disconnected);
            assert!(h.gate.is_open(), "give-up must re-enable shell input");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_gives_up_immediately() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[], 2);
            {
                let mut engine = h.engine.borrow_mut();
                engine.connect(0, 3, true);
                engine.connect(1, 3, true);
            }
            h.gate.disable();
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.state(1), ConnectionState::Disconnected);
            assert!(h.gate.is_open());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_alien_preemption_then_success() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.host.preempt_ok.set(true);
            h.host.script(addr(0), &[Step::Busy, Step::Succeed]);

            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Connected);
            assert_eq!(h.host.preempt_count.get(), 1);
            assert_eq!(h.host.establish_count.get(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_preemption_is_fatal() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.host.preempt_ok.set(false);
            h.host.script(addr(0), &[Step::Busy]);

            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.host.establish_count.get(), 1, "no retry after failed preempt");
            assert_eq!(h.adapter_in_use(0), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_after_two_timeouts() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.host.script(addr(0), &[Step::Hang, Step::Hang]);

            h.engine.borrow_mut().connect(0, 2, true);
            h.gate.disable();
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.host.establish_count.get(), 2);
            assert_eq!(h.adapter_in_use(0), 0);
            assert!(h.gate.is_open());

            // The record stays usable: a later connect may run again.
            h.host.script(addr(0), &[Step::Succeed]);
            h.engine.borrow_mut().connect(0, 1, false);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Connected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_socket_error_retries_until_success() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.host
                .script(addr(0), &[Step::SocketError, Step::SocketError, Step::Succeed]);

            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Connected);
            assert_eq!(h.host.establish_count.get(), 3);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristics_is_fatal() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.host.script(addr(0), &[Step::MissingCharacteristics]);

            h.engine.borrow_mut().connect(0, 5, false);
            h.drain().await;

            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.host.establish_count.get(), 1, "fatal bring-up must not retry");
            assert_eq!(h.adapter_in_use(0), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_adapter_load_balances_within_one() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5), (1, 5), (2, 5)], 7);
            {
                let mut engine = h.engine.borrow_mut();
                for i in 0..7 {
                    engine.connect(i, 3, false);
                }
            }
            h.drain().await;

            assert_eq!(h.connected_count(), 7);
            let counts: Vec<usize> = (0..3).map(|i| h.adapter_in_use(i)).collect();
            let max = counts.iter().max().unwrap();
            let min = counts.iter().min().unwrap();
            assert!(max - min <= 1, "unbalanced adapters: {counts:?}");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_att_disconnect_tears_down_without_reconnect() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Connected);

            let link = h.host.link_for(addr(0));
            link.events_tx
                .send(LinkEvent::Disconnected("connection reset by peer".into()))
                .unwrap();
            h.settle().await;

            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.adapter_in_use(0), 0);
            // Runtime link loss never reconnects by itself.
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Disconnected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_notifications_flow_into_the_record() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;

            let link = h.host.link_for(addr(0));
            link.events_tx
                .send(LinkEvent::Notification(vec![3, 0x19, 0x63, 0x38]))
                .unwrap();
            link.events_tx
                .send(LinkEvent::Notification(vec![3, 0x1b, 0x5c, 0x0f]))
                .unwrap();
            h.settle().await;

            let engine = h.engine.borrow();
            let vehicle = engine.registry().get(0).unwrap();
            assert_eq!(vehicle.version, 0x3863);
            assert_eq!(vehicle.voltage_mv, 3932);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_round_trips_in_request_order() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);
            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;

            {
                let mut engine = h.engine.borrow_mut();
                let vehicle = engine.registry_mut().get_mut(0).unwrap();
                for id in 10..13 {
                    assert!(vehicle.ping_with_id(id, false));
                }
                assert_eq!(vehicle.pending_pings(), 3);
            }

            let link = h.host.link_for(addr(0));
            for _ in 0..3 {
                link.events_tx
                    .send(LinkEvent::Notification(vec![1, 0x17]))
                    .unwrap();
            }
            h.settle().await;

            assert_eq!(
                h.engine.borrow().registry().get(0).unwrap().pending_pings(),
                0
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_drains_every_counter() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 3), (1, 3)], 5);
            {
                let mut engine = h.engine.borrow_mut();
                for i in 0..5 {
                    engine.connect(i, 3, false);
                }
            }
            h.drain().await;
            assert_eq!(h.connected_count(), 5);

            // Polite disconnect first, one loop pass, then teardown.
            {
                let mut engine = h.engine.borrow_mut();
                for i in 0..5 {
                    assert!(engine.registry_mut().get_mut(i).unwrap().disconnect_politely());
                }
            }
            h.settle().await;
            h.engine.borrow_mut().shutdown();
            h.drain().await;

            assert_eq!(h.connected_count(), 0);
            assert_eq!(h.adapter_in_use(0) + h.adapter_in_use(1), 0);
            assert!(!h.engine.borrow().has_pending_work(), "no pending timers remain");
            for i in 0..5 {
                assert_eq!(h.state(i), ConnectionState::Disconnected);
                let last_write = {
                    let link = h.host.link_for(addr(i as u8));
                    let writes = link.writes.borrow();
                    writes.last().cloned().unwrap()
                };
                assert_eq!(last_write, vec![1, 0x0d], "polite disconnect went out last");
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent_from_any_state() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 1);

            // From Disconnected.
            h.engine.borrow_mut().disconnect(0);
            assert_eq!(h.state(0), ConnectionState::Disconnected);

            // From ShouldConnect.
            h.engine.borrow_mut().connect(0, 3, false);
            h.engine.borrow_mut().disconnect(0);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Disconnected);

            // From Connected, twice in a row.
            h.engine.borrow_mut().connect(0, 3, false);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Connected);
            h.engine.borrow_mut().disconnect(0);
            h.engine.borrow_mut().disconnect(0);
            h.drain().await;
            assert_eq!(h.state(0), ConnectionState::Disconnected);
            assert_eq!(h.adapter_in_use(0), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_ids_stay_unique_and_reusable() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut h = harness(&[(0, 5)], 3);
            {
                let mut engine = h.engine.borrow_mut();
                for i in 0..3 {
                    engine.connect(i, 3, false);
                }
            }
            h.drain().await;

            let ids: Vec<Option<u8>> = {
                let engine = h.engine.borrow();
                engine.registry().iter().map(|v| v.connection_id).collect()
            };
            assert_eq!(ids, vec![Some(0), Some(1), Some(2)]);

            // Freeing the middle id makes it the next allocation.
            h.engine.borrow_mut().disconnect(1);
            h.drain().await;
            h.engine.borrow_mut().connect(1, 3, false);
            h.drain().await;
            assert_eq!(
                h.engine.borrow().registry().get(1).unwrap().connection_id,
                Some(1)
            );
        })
        .await;
}
