//! Interactive command shell
//!
//! Line-oriented REPL driving the engine: one command table, a vehicle
//! selection that commands fan out over, and an input gate the engine
//! closes while connection attempts are pending. `--background` mode
//! drops the prompt and reads stdin until EOF.

use std::collections::VecDeque;
use std::io::Write as _;

use anki_transport::protocol::supercode;
use anki_transport::{Address, LightChannel, LightEffect, TrackMaterial};
use crossterm::style::Stylize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::engine::{EngineHandle, InputGate};
use crate::output::Output;
use crate::scanner;
use crate::vehicle::DEFAULT_ACCELERATION;

/// Connection attempts per `connect` command.
const CONNECT_TRIES: usize = 3;

/// The shell's target: every vehicle, none, or one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// All-zero address: commands fan out over the whole fleet.
    Broadcast,
    /// All-ones address: no vehicle selected.
    Dummy,
    Vehicle(Address),
}

impl Selection {
    pub fn from_address(address: Address) -> Self {
        if address == Address::ANY {
            Selection::Broadcast
        } else if address == Address::NONE {
            Selection::Dummy
        } else {
            Selection::Vehicle(address)
        }
    }
}

enum Action {
    Continue,
    Quit,
    RunScript(String),
}

struct CommandSpec {
    name: &'static str,
    params: &'static str,
    desc: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "help", params: "", desc: "Show this help" },
    CommandSpec { name: "exit", params: "", desc: "Exit interactive mode" },
    CommandSpec { name: "quit", params: "", desc: "Exit interactive mode" },
    CommandSpec { name: "scan", params: "[devid]", desc: "Scan for vehicles" },
    CommandSpec { name: "connect", params: "[vehicle-name]", desc: "Connect to a remote device. Works standalone (connect HADION0) or after select-vehicle" },
    CommandSpec { name: "disconnect", params: "", desc: "Disconnect from a remote device" },
    CommandSpec { name: "disrupt", params: "", desc: "Disrupt alien connections to remote device" },
    CommandSpec { name: "list-vehicles", params: "", desc: "Show configured vehicles and connection status" },
    CommandSpec { name: "select-vehicle", params: "<id|name|mac>", desc: "Select vehicle to control" },
    CommandSpec { name: "sdk-mode", params: "<0|1>", desc: "Set SDK Mode" },
    CommandSpec { name: "ping", params: "", desc: "Send ping message to vehicle." },
    CommandSpec { name: "get-version", params: "", desc: "Request vehicle software version." },
    CommandSpec { name: "get-battery", params: "", desc: "Request vehicle battery level." },
    CommandSpec { name: "set-speed", params: "<speed> [accel]", desc: "Set vehicle speed (mm/sec) with acceleration (mm/sec^2)" },
    CommandSpec { name: "change-lane", params: "<hspeed> <haccel> <offset>", desc: "Change lanes at speed and acceleration in the offset direction (right(+), left(-)), anchored at the current position." },
    CommandSpec { name: "change-lane-abs", params: "<hspeed> <haccel> <offset>", desc: "Change lanes at speed and acceleration to the lateral position relative to the anchor set with set-offset." },
    CommandSpec { name: "cancel-lane-change", params: "", desc: "Cancels any lane change in progress." },
    CommandSpec { name: "set-offset", params: "[mm]", desc: "Sets the current lateral position in mm from the road center." },
    CommandSpec { name: "correct-offset", params: "<delta>", desc: "Adds a correction in mm to the lateral anchor position." },
    CommandSpec { name: "configure-track", params: "<lanes>", desc: "Announce the number of track lanes to the vehicle." },
    CommandSpec { name: "uturn", params: "", desc: "Turn the vehicle around by 180 degrees." },
    CommandSpec { name: "set-lights", params: "<hex>", desc: "Set the light mask, e.g. 22 for brake lights on." },
    CommandSpec { name: "set-lights-pattern", params: "<channel> <effect> <start> <end> <cpm>", desc: "Animate a light channel." },
    CommandSpec { name: "vehicle-disconnect", params: "", desc: "Ask the vehicle to drop the connection itself." },
    CommandSpec { name: "read-data", params: "", desc: "Read the notify characteristic once." },
    CommandSpec { name: "verbose", params: "[0..2]", desc: "Show or set the verbosity level." },
    CommandSpec { name: "sleep", params: "<sec>", desc: "Pause command input for the given time." },
    CommandSpec { name: "execute", params: "<script>", desc: "Execute commands from a script file." },
    CommandSpec { name: "check", params: "connected-vehicles <names...>", desc: "Connect the named vehicles with infinite retries and wait." },
    CommandSpec { name: "set-material", params: "<vinyl|plastic>", desc: "Set the track material for localization parsing." },
    CommandSpec { name: "hci-state", params: "", desc: "Show adapter usage counters." },
];

pub struct Shell {
    engine: EngineHandle,
    gate: InputGate,
    out: Output,
    selection: Selection,
    background: bool,
    script_lines: VecDeque<String>,
}

impl Shell {
    pub fn new(engine: EngineHandle, gate: InputGate, out: Output, background: bool) -> Self {
        Self {
            engine,
            gate,
            out,
            selection: Selection::Broadcast,
            background,
            script_lines: VecDeque::new(),
        }
    }

    /// Read and dispatch commands until exit or EOF.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.gate.wait_open().await;

            let line = if let Some(queued) = self.script_lines.pop_front() {
                if self.out.verbosity() > 0 {
                    self.out.line(format!("exec: {queued}"));
                }
                queued
            } else {
                if !self.background {
                    self.print_prompt();
                }
                match lines.next_line().await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            };

            match self.dispatch_line(&line) {
                Action::Continue => {}
                Action::Quit => return Ok(()),
                Action::RunScript(path) => self.load_script(&path),
            }
        }
    }

    fn print_prompt(&self) {
        let engine = self.engine.borrow();
        let prompt = match self.selection {
            Selection::Broadcast => {
                let label = format!("[{:>17}]", "Broadcast (0)");
                if engine.registry().connected_count() > 0 {
                    format!("{}", label.blue())
                } else {
                    label
                }
            }
            Selection::Dummy => format!("[{:>17}]", "Dummy (0xFF)"),
            Selection::Vehicle(address) => {
                match engine.registry().index_by_address(address) {
                    Some(index) => {
                        let vehicle = engine.registry().get(index).unwrap();
                        let label = format!("[{:>17}]", vehicle.name);
                        if vehicle.is_connected() {
                            format!("{}", label.blue())
                        } else {
                            label
                        }
                    }
                    None => format!("{}", format!("[{:>17}]", address.to_string()).red()),
                }
            }
        };
        print!("{prompt}> ");
        let _ = std::io::stdout().flush();
    }

    fn load_script(&mut self, path: &str) {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                self.script_lines = content.lines().map(str::to_string).collect();
            }
            Err(_) => {
                self.out
                    .error(format!("Cannot open '{path}' for execution."));
            }
        }
    }

    fn usage(&self, name: &str) {
        if let Some(spec) = COMMANDS.iter().find(|c| c.name == name) {
            self.out
                .error(format!("Usage: {} {}", spec.name, spec.params));
        }
    }

    /// Indices of the vehicles the current selection addresses.
    fn selected(&self) -> Vec<usize> {
        let engine = self.engine.borrow();
        match self.selection {
            Selection::Broadcast => (0..engine.registry().len()).collect(),
            Selection::Dummy => Vec::new(),
            Selection::Vehicle(address) => engine
                .registry()
                .index_by_address(address)
                .into_iter()
                .collect(),
        }
    }

    fn dispatch_line(&mut self, line: &str) -> Action {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return Action::Continue;
        };
        let args = &parts[1..];

        match command {
            "help" => self.cmd_help(),
            "exit" | "quit" => return Action::Quit,
            "scan" => self.cmd_scan(args),
            "connect" => self.cmd_connect(args),
            "disconnect" => self.for_selected(|engine, index| engine.disconnect(index)),
            "disrupt" => self.for_selected(|engine, index| {
                engine.disrupt(index);
            }),
            "list-vehicles" => self.cmd_list_vehicles(),
            "select-vehicle" => self.cmd_select_vehicle(args),
            "sdk-mode" => match args {
                [state] => match state.parse::<u8>() {
                    Ok(state) => self.for_selected_vehicle(|v| {
                        v.set_sdk_mode(state);
                    }),
                    Err(_) => self.usage("sdk-mode"),
                },
                _ => self.usage("sdk-mode"),
            },
            "ping" => self.for_selected_vehicle(|v| {
                v.ping(false);
            }),
            "get-version" => self.for_selected_vehicle(|v| {
                v.request_version(false);
            }),
            "get-battery" => self.for_selected_vehicle(|v| {
                v.request_voltage(false);
            }),
            "set-speed" => self.cmd_set_speed(args),
            "change-lane" => self.cmd_change_lane(args, false),
            "change-lane-abs" => self.cmd_change_lane(args, true),
            "cancel-lane-change" => {
                self.out.line("cancelling lane change");
                self.for_selected_vehicle(|v| {
                    v.cancel_lane_change(false);
                });
            }
            "set-offset" => self.cmd_set_offset(args),
            "correct-offset" => self.cmd_correct_offset(args),
            "configure-track" => self.cmd_configure_track(args),
            "uturn" => self.for_selected_vehicle(|v| {
                v.uturn();
            }),
            "set-lights" => self.cmd_set_lights(args),
            "set-lights-pattern" => self.cmd_set_lights_pattern(args),
            "vehicle-disconnect" => self.for_selected_vehicle(|v| {
                v.disconnect_politely();
            }),
            "read-data" => self.for_selected_vehicle(|v| {
                v.read();
            }),
            "verbose" => self.cmd_verbose(args),
            "sleep" => self.cmd_sleep(args),
            "execute" => match args {
                [path] => return Action::RunScript(path.to_string()),
                _ => self.usage("execute"),
            },
            "check" => self.cmd_check(args),
            "set-material" => self.cmd_set_material(args),
            "hci-state" => {
                let engine = self.engine.borrow();
                for row in engine.pool().state_rows() {
                    engine.output().line(row);
                }
            }
            unknown => self.out.error(format!("Unknown command: {unknown}")),
        }
        Action::Continue
    }

    fn for_selected(&self, mut f: impl FnMut(&mut crate::engine::Engine, usize)) {
        let indices = self.selected();
        let mut engine = self.engine.borrow_mut();
        for index in indices {
            f(&mut engine, index);
        }
    }

    fn for_selected_vehicle(&self, mut f: impl FnMut(&mut crate::vehicle::Vehicle)) {
        let indices = self.selected();
        let mut engine = self.engine.borrow_mut();
        for index in indices {
            if let Some(vehicle) = engine.registry_mut().get_mut(index) {
                f(vehicle);
            }
        }
    }

    fn cmd_help(&self) {
        for spec in COMMANDS {
            self.out
                .line(format!("{:<20} {:<40} {}", spec.name, spec.params, spec.desc));
        }
    }

    fn cmd_scan(&mut self, args: &[&str]) {
        if args.len() > 1 {
            self.usage("scan");
            return;
        }
        let dev_id = args.first().and_then(|a| a.parse::<u16>().ok());
        let mut engine = self.engine.borrow_mut();
        scanner::scan(&mut engine, dev_id);
    }

    fn cmd_connect(&mut self, args: &[&str]) {
        match args {
            [] => {}
            [name] => {
                let index = self.engine.borrow().registry().index_by_name(name);
                match index {
                    Some(index) => {
                        let address = self.engine.borrow().registry().get(index).unwrap().address;
                        self.selection = Selection::Vehicle(address);
                    }
                    None => {
                        self.selection = Selection::Dummy;
                        self.out.error("Invalid vehicle name.");
                    }
                }
            }
            _ => {
                self.usage("connect");
                return;
            }
        }

        let indices = self.selected();
        let mut engine = self.engine.borrow_mut();
        for index in indices {
            engine.connect(index, CONNECT_TRIES, true);
        }
        if engine.registry().is_waiting_for_pending() {
            self.gate.disable();
        }
    }

    fn cmd_list_vehicles(&self) {
        let engine = self.engine.borrow();
        for (position, vehicle) in engine.registry().iter().enumerate() {
            let mut row = format!(
                "{:>2} {:>12} {:>18}  v{:04x}{}",
                position + 1,
                vehicle.name,
                vehicle.address.to_string(),
                vehicle.version,
                vehicle.firmware_tag()
            );
            if vehicle.is_connected() {
                let via = vehicle
                    .adapter
                    .map(|a| engine.pool().get(a).dev_id)
                    .unwrap_or_default();
                row.push_str(&format!("{}", format!("   Connected via hci{via}").blue()));
            } else if vehicle.is_connecting() {
                row.push_str("   Connecting");
            } else if vehicle.should_connect() {
                row.push_str("   Should connect");
            } else {
                row.push_str("   Disconnected");
            }
            engine.output().line(row);
        }
    }

    fn cmd_select_vehicle(&mut self, args: &[&str]) {
        let [argument] = args else {
            self.usage("select-vehicle");
            return;
        };

        if let Ok(id) = argument.parse::<usize>() {
            let engine = self.engine.borrow();
            if id > engine.registry().len() {
                self.selection = Selection::Dummy;
                engine.output().error("Invalid vehicle id.");
            } else if id == 0 {
                self.selection = Selection::Broadcast;
            } else {
                let address = engine.registry().get(id - 1).unwrap().address;
                self.selection = Selection::from_address(address);
            }
            return;
        }

        if argument.len() == 17 {
            if let Ok(address) = argument.parse::<Address>() {
                self.selection = Selection::from_address(address);
                return;
            }
        }

        let index = self.engine.borrow().registry().index_by_name(argument);
        match index {
            Some(index) => {
                let address = self.engine.borrow().registry().get(index).unwrap().address;
                self.selection = Selection::Vehicle(address);
            }
            None => {
                self.selection = Selection::Dummy;
                self.out.error("Invalid vehicle name.");
            }
        }
    }

    fn cmd_set_speed(&self, args: &[&str]) {
        let (speed, accel) = match args {
            [speed] => (speed.parse::<u16>(), Ok(DEFAULT_ACCELERATION)),
            [speed, accel] => (speed.parse::<u16>(), accel.parse::<u16>()),
            _ => {
                self.usage("set-speed");
                return;
            }
        };
        let (Ok(speed), Ok(accel)) = (speed, accel) else {
            self.usage("set-speed");
            return;
        };
        self.for_selected_vehicle(|v| {
            v.set_speed(speed, accel, false);
        });
    }

    fn cmd_change_lane(&self, args: &[&str], absolute: bool) {
        let [speed, accel, offset] = args else {
            self.usage(if absolute { "change-lane-abs" } else { "change-lane" });
            return;
        };
        let (Ok(speed), Ok(accel), Ok(offset)) = (
            speed.parse::<u16>(),
            accel.parse::<u16>(),
            offset.parse::<f32>(),
        ) else {
            self.usage(if absolute { "change-lane-abs" } else { "change-lane" });
            return;
        };

        if absolute {
            self.out.line(format!(
                "changing lane at {speed} (acceleration = {accel} | offset from road center = {offset:.2})"
            ));
            self.for_selected_vehicle(|v| {
                v.change_lane_abs(speed, accel, offset);
            });
        } else {
            self.out.line(format!(
                "changing lane at {speed} (acceleration = {accel} | offset from position = {offset:.2})"
            ));
            self.for_selected_vehicle(|v| {
                v.change_lane(speed, accel, offset);
            });
        }
    }

    fn cmd_set_offset(&self, args: &[&str]) {
        let offset = match args {
            [] => 0.0,
            [offset] => match offset.parse::<f32>() {
                Ok(offset) => offset,
                Err(_) => {
                    self.usage("set-offset");
                    return;
                }
            },
            _ => {
                self.usage("set-offset");
                return;
            }
        };
        self.out
            .line(format!("set road offset (offset = {offset:.2})"));
        self.for_selected_vehicle(|v| {
            v.set_offset(offset);
        });
    }

    fn cmd_correct_offset(&self, args: &[&str]) {
        let [delta] = args else {
            self.usage("correct-offset");
            return;
        };
        let Ok(delta) = delta.parse::<f32>() else {
            self.usage("correct-offset");
            return;
        };
        self.out.line(format!("correct offset (delta = {delta:.2})"));
        self.for_selected_vehicle(|v| {
            v.correct_offset(delta);
        });
    }

    fn cmd_configure_track(&self, args: &[&str]) {
        let [lanes] = args else {
            self.usage("configure-track");
            return;
        };
        let Ok(lanes) = lanes.parse::<u8>() else {
            self.usage("configure-track");
            return;
        };
        self.out
            .line(format!("configure track (number of lanes = {lanes})"));
        self.for_selected_vehicle(|v| {
            v.configure_track(lanes);
        });
    }

    fn cmd_set_lights(&self, args: &[&str]) {
        let [mask] = args else {
            self.usage("set-lights");
            return;
        };
        let Ok(mask) = u8::from_str_radix(mask.trim_start_matches("0x"), 16) else {
            self.usage("set-lights");
            return;
        };
        self.for_selected_vehicle(|v| {
            v.set_lights(mask, false);
        });
    }

    fn cmd_set_lights_pattern(&self, args: &[&str]) {
        let [channel, effect, start, end, cpm] = args else {
            self.usage("set-lights-pattern");
            return;
        };
        let Some(channel) = LightChannel::from_name(channel) else {
            self.out
                .error("Channel must be one of RED, TAIL, BLUE, GREEN, FRONTL, FRONTR.");
            return;
        };
        let Some(effect) = LightEffect::from_name(effect) else {
            self.out
                .error("Effect must be one of STEADY, FADE, THROB, FLASH, RANDOM.");
            return;
        };
        let (Ok(start), Ok(end), Ok(cpm)) =
            (start.parse::<u8>(), end.parse::<u8>(), cpm.parse::<u16>())
        else {
            self.usage("set-lights-pattern");
            return;
        };
        self.for_selected_vehicle(|v| {
            v.set_lights_pattern(channel, effect, start, end, cpm);
        });
    }

    fn cmd_verbose(&self, args: &[&str]) {
        match args {
            [] => self.out.line(format!(
                "Verbosity level is set to {}.",
                self.out.verbosity()
            )),
            [level] => match level.parse::<u8>() {
                Ok(level) if level <= 2 => self.out.set_verbosity(level),
                _ => self.out.error("Invalid value. Maximum verbosity is 2."),
            },
            _ => self.usage("verbose"),
        }
    }

    fn cmd_sleep(&self, args: &[&str]) {
        let [seconds] = args else {
            self.usage("sleep");
            return;
        };
        let Ok(seconds) = seconds.parse::<f64>() else {
            self.out
                .error("sleep: First argument needs to be a non-negative number.");
            return;
        };
        if seconds < 0.0 {
            self.out
                .error("sleep: First argument needs to be a non-negative number.");
            return;
        }

        self.gate.disable();
        let gate = self.gate.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
            gate.enable();
        });
    }

    fn cmd_check(&mut self, args: &[&str]) {
        let Some((&"connected-vehicles", names)) = args.split_first() else {
            self.usage("check");
            return;
        };
        if names.is_empty() {
            self.usage("check");
            return;
        }

        let mut engine = self.engine.borrow_mut();
        for name in names {
            match engine.registry().index_by_name(name) {
                // Zero tries: retry until the vehicle shows up.
                Some(index) => {
                    engine.connect(index, 0, true);
                }
                None => engine
                    .output()
                    .error(format!("{name}: Not a valid vehicle name.")),
            }
        }
        if engine.registry().is_waiting_for_pending() {
            self.gate.disable();
        }
    }

    fn cmd_set_material(&self, args: &[&str]) {
        let material = match args {
            [m] if m.eq_ignore_ascii_case("vinyl") => TrackMaterial::Vinyl,
            [m] if m.eq_ignore_ascii_case("plastic") => TrackMaterial::Plastic,
            _ => {
                self.usage("set-material");
                return;
            }
        };
        self.for_selected_vehicle(|v| {
            v.set_config_parameters(supercode::ALL, material);
        });
    }
}
