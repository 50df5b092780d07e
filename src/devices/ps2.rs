//! Intel 8042 keyboard controller with a keyboard and an auxiliary (mouse) port.
//!
//! | Port | Read | Write |
//! |------|------|-------|
//! | 0x60 | output buffer | data: command argument or device command |
//! | 0x64 | status register | controller command |
//!
//! Bytes reach the output buffer from three queues, in priority order:
//! controller responses, keyboard, auxiliary device. Each byte entering the
//! buffer pulses IRQ 1 (keyboard) or IRQ 12 (auxiliary) if the configuration
//! byte enables it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AccessWidth, Device, DeviceSnapshot, IrqLine, PowerCallback, PowerEvent, SnapshotError};

pub const PS2_DATA: u16 = 0x60;
pub const PS2_STATUS: u16 = 0x64;
pub const KEYBOARD_IRQ: u32 = 1;
pub const AUX_IRQ: u32 = 12;

// Status register
const STATUS_OBF: u8 = 1 << 0;
const STATUS_SYS: u8 = 1 << 2;
const STATUS_CMD: u8 = 1 << 3;
const STATUS_UNLOCKED: u8 = 1 << 4;
const STATUS_AUX_OBF: u8 = 1 << 5;

// Configuration byte
const CFG_KBD_INT: u8 = 1 << 0;
const CFG_AUX_INT: u8 = 1 << 1;
const CFG_SYS: u8 = 1 << 2;
const CFG_KBD_DISABLE: u8 = 1 << 4;
const CFG_AUX_DISABLE: u8 = 1 << 5;
const CFG_TRANSLATE: u8 = 1 << 6;

// Output port
const OUT_RESET: u8 = 1 << 0;
const OUT_A20: u8 = 1 << 1;

// Device responses
const ACK: u8 = 0xFA;
const RESEND: u8 = 0xFE;
const SELF_TEST_OK: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Source {
    Controller,
    Keyboard,
    Aux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Keyboard {
    queue: VecDeque<u8>,
    scanning: bool,
    scancode_set: u8,
    leds: u8,
    typematic: u8,
    /// Command waiting for its parameter byte.
    param_for: Option<u8>,
    last_sent: u8,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            scanning: true,
            scancode_set: 2,
            leds: 0,
            typematic: 0x2B,
            param_for: None,
            last_sent: 0,
        }
    }
}

impl Keyboard {
    fn reply(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes);
        if let Some(&last) = bytes.last() {
            self.last_sent = last;
        }
    }

    fn set_defaults(&mut self) {
        self.scancode_set = 2;
        self.typematic = 0x2B;
    }

    fn command(&mut self, byte: u8) {
        if let Some(cmd) = self.param_for.take() {
            match cmd {
                0xED => {
                    self.leds = byte & 7;
                    self.reply(&[ACK]);
                }
                0xF0 => match byte {
                    0 => self.reply(&[ACK, self.scancode_set]),
                    1..=3 => {
                        self.scancode_set = byte;
                        self.reply(&[ACK]);
                    }
                    _ => self.reply(&[RESEND]),
                },
                0xF3 => {
                    self.typematic = byte & 0x7F;
                    self.reply(&[ACK]);
                }
                _ => {}
            }
            return;
        }

        match byte {
            0xED | 0xF0 | 0xF3 => {
                self.param_for = Some(byte);
                self.reply(&[ACK]);
            }
            0xEE => self.reply(&[0xEE]),
            0xF2 => self.reply(&[ACK, 0xAB, 0x83]),
            0xF4 => {
                self.scanning = true;
                self.reply(&[ACK]);
            }
            0xF5 => {
                self.scanning = false;
                self.set_defaults();
                self.reply(&[ACK]);
            }
            0xF6 => {
                self.set_defaults();
                self.reply(&[ACK]);
            }
            0xFE => {
                let last = self.last_sent;
                self.queue.push_back(last);
            }
            0xFF => {
                self.queue.clear();
                self.scanning = true;
                self.set_defaults();
                self.reply(&[ACK, SELF_TEST_OK]);
            }
            _ => {
                debug!("PS/2 keyboard: unknown command {:#x}", byte);
                self.reply(&[RESEND]);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Mouse {
    queue: VecDeque<u8>,
    reporting: bool,
    remote: bool,
    scaling_2to1: bool,
    sample_rate: u8,
    resolution: u8,
    buttons: u8,
    param_for: Option<u8>,
}

impl Default for Mouse {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            reporting: false,
            remote: false,
            scaling_2to1: false,
            sample_rate: 100,
            resolution: 2,
            buttons: 0,
            param_for: None,
        }
    }
}

impl Mouse {
    fn set_defaults(&mut self) {
        self.sample_rate = 100;
        self.resolution = 2;
        self.scaling_2to1 = false;
        self.remote = false;
    }

    fn packet(&self, dx: i16, dy: i16) -> [u8; 3] {
        let mut flags = 0x08 | (self.buttons & 7);
        if dx < 0 {
            flags |= 0x10;
        }
        if dy < 0 {
            flags |= 0x20;
        }
        if !(-256..=255).contains(&dx) {
            flags |= 0x40;
        }
        if !(-256..=255).contains(&dy) {
            flags |= 0x80;
        }
        [flags, dx as u8, dy as u8]
    }

    fn command(&mut self, byte: u8) {
        if let Some(cmd) = self.param_for.take() {
            match cmd {
                0xE8 => self.resolution = byte & 3,
                0xF3 => self.sample_rate = byte,
                _ => {}
            }
            self.queue.push_back(ACK);
            return;
        }

        match byte {
            0xE6 | 0xE7 => {
                self.scaling_2to1 = byte == 0xE7;
                self.queue.push_back(ACK);
            }
            0xE8 | 0xF3 => {
                self.param_for = Some(byte);
                self.queue.push_back(ACK);
            }
            0xE9 => {
                let status = ((self.remote as u8) << 6)
                    | ((self.reporting as u8) << 5)
                    | ((self.scaling_2to1 as u8) << 4)
                    | (self.buttons & 7);
                self.queue
                    .extend([ACK, status, self.resolution, self.sample_rate]);
            }
            0xEA | 0xF0 => {
                self.remote = byte == 0xF0;
                self.queue.push_back(ACK);
            }
            0xEB => {
                self.queue.push_back(ACK);
                let packet = self.packet(0, 0);
                self.queue.extend(packet);
            }
            0xF2 => self.queue.extend([ACK, 0x00]),
            0xF4 => {
                self.reporting = true;
                self.queue.push_back(ACK);
            }
            0xF5 => {
                self.reporting = false;
                self.queue.push_back(ACK);
            }
            0xF6 => {
                self.set_defaults();
                self.queue.push_back(ACK);
            }
            0xFF => {
                self.queue.clear();
                self.reporting = false;
                self.set_defaults();
                self.queue.extend([ACK, SELF_TEST_OK, 0x00]);
            }
            _ => {
                debug!("PS/2 aux: unknown command {:#x}", byte);
                self.queue.push_back(RESEND);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ps2State {
    config: u8,
    output_port: u8,
    /// Last write went to the command port.
    last_was_command: bool,
    /// Controller command waiting for a data byte on port 0x60.
    pending: Option<u8>,
    output: Option<(u8, Source)>,
    last_data: u8,
    controller_queue: VecDeque<u8>,
    keyboard: Keyboard,
    mouse: Mouse,
}

impl Default for Ps2State {
    fn default() -> Self {
        Self {
            config: CFG_KBD_INT | CFG_AUX_INT | CFG_SYS | CFG_TRANSLATE,
            output_port: OUT_RESET | OUT_A20,
            last_was_command: false,
            pending: None,
            output: None,
            last_data: 0,
            controller_queue: VecDeque::new(),
            keyboard: Keyboard::default(),
            mouse: Mouse::default(),
        }
    }
}

/// 8042 controller.
pub struct Ps2Controller {
    state: Ps2State,
    kbd_irq: IrqLine,
    aux_irq: IrqLine,
    power: Option<PowerCallback>,
}

impl Ps2Controller {
    pub fn new(kbd_irq: IrqLine, aux_irq: IrqLine) -> Self {
        Self {
            state: Ps2State::default(),
            kbd_irq,
            aux_irq,
            power: None,
        }
    }

    /// Route reset-line pulses to the platform.
    pub fn set_power_callback(&mut self, cb: PowerCallback) {
        self.power = Some(cb);
    }

    /// Gate A20 as driven by the output port.
    pub fn a20_enabled(&self) -> bool {
        self.state.output_port & OUT_A20 != 0
    }

    /// Host key event. `code` is a set 1 make code when the guest sees set 1
    /// (translation on, or set 1 selected), otherwise a set 2 make code.
    pub fn key_event(&mut self, code: u8, pressed: bool) {
        let kbd = &mut self.state.keyboard;
        if !kbd.scanning {
            return;
        }
        let set1 = self.state.config & CFG_TRANSLATE != 0 || kbd.scancode_set == 1;
        match (pressed, set1) {
            (true, _) => kbd.queue.push_back(code),
            (false, true) => kbd.queue.push_back(code | 0x80),
            (false, false) => kbd.queue.extend([0xF0, code]),
        }
        self.fill_output();
    }

    /// Host mouse motion. Dropped unless the guest enabled stream reporting.
    pub fn mouse_event(&mut self, dx: i16, dy: i16, buttons: u8) {
        let mouse = &mut self.state.mouse;
        mouse.buttons = buttons & 7;
        if !mouse.reporting || mouse.remote {
            return;
        }
        let packet = mouse.packet(dx, dy);
        mouse.queue.extend(packet);
        self.fill_output();
    }

    fn status(&self) -> u8 {
        let mut status = STATUS_UNLOCKED;
        if self.state.config & CFG_SYS != 0 {
            status |= STATUS_SYS;
        }
        if self.state.last_was_command {
            status |= STATUS_CMD;
        }
        match self.state.output {
            Some((_, Source::Aux)) => status |= STATUS_OBF | STATUS_AUX_OBF,
            Some(_) => status |= STATUS_OBF,
            None => {}
        }
        status
    }

    /// Move the next queued byte into an empty output buffer.
    fn fill_output(&mut self) {
        if self.state.output.is_some() {
            return;
        }
        let s = &mut self.state;
        let next = if let Some(b) = s.controller_queue.pop_front() {
            Some((b, Source::Controller))
        } else if s.config & CFG_KBD_DISABLE == 0 && !s.keyboard.queue.is_empty() {
            s.keyboard.queue.pop_front().map(|b| (b, Source::Keyboard))
        } else if s.config & CFG_AUX_DISABLE == 0 {
            s.mouse.queue.pop_front().map(|b| (b, Source::Aux))
        } else {
            None
        };

        let Some((byte, source)) = next else {
            return;
        };
        s.output = Some((byte, source));
        match source {
            Source::Aux if s.config & CFG_AUX_INT != 0 => self.aux_irq.pulse(),
            Source::Controller | Source::Keyboard if s.config & CFG_KBD_INT != 0 => {
                self.kbd_irq.pulse()
            }
            _ => {}
        }
    }

    fn respond(&mut self, byte: u8) {
        self.state.controller_queue.push_back(byte);
        self.fill_output();
    }

    fn read_data(&mut self) -> u8 {
        if let Some((byte, _)) = self.state.output.take() {
            self.state.last_data = byte;
        }
        self.fill_output();
        self.state.last_data
    }

    fn write_output_port(&mut self, value: u8) {
        self.state.output_port = value;
        if value & OUT_RESET == 0 {
            self.request_reset();
        }
    }

    fn request_reset(&mut self) {
        info!("PS/2 controller requested CPU reset");
        if let Some(cb) = &self.power {
            cb(PowerEvent::SoftReset);
        }
    }

    fn write_command(&mut self, cmd: u8) {
        self.state.last_was_command = true;
        self.state.pending = None;
        match cmd {
            0x20 => {
                let config = self.state.config;
                self.respond(config);
            }
            0x21..=0x3F => self.respond(0),
            0x60..=0x7F | 0xD1..=0xD4 => self.state.pending = Some(cmd),
            0xA7 => self.state.config |= CFG_AUX_DISABLE,
            0xA8 => {
                self.state.config &= !CFG_AUX_DISABLE;
                self.fill_output();
            }
            0xA9 | 0xAB => self.respond(0x00),
            0xAA => self.respond(0x55),
            0xAD => self.state.config |= CFG_KBD_DISABLE,
            0xAE => {
                self.state.config &= !CFG_KBD_DISABLE;
                self.fill_output();
            }
            0xC0 => self.respond(0x80),
            0xD0 => {
                let port = self.state.output_port;
                self.respond(port);
            }
            0xDD => self.state.output_port &= !OUT_A20,
            0xDF => self.state.output_port |= OUT_A20,
            0xF0..=0xFF => {
                // Pulse output port lines selected by low clear bits.
                if cmd & 1 == 0 {
                    self.request_reset();
                }
            }
            _ => debug!("PS/2: unknown controller command {:#x}", cmd),
        }
    }

    fn write_data(&mut self, byte: u8) {
        self.state.last_was_command = false;
        match self.state.pending.take() {
            Some(0x60) => self.state.config = byte,
            Some(0x61..=0x7F) => {}
            Some(0xD1) => self.write_output_port(byte),
            Some(0xD2) => self.state.keyboard.queue.push_back(byte),
            Some(0xD3) => self.state.mouse.queue.push_back(byte),
            Some(0xD4) => self.state.mouse.command(byte),
            _ => {
                // Writing the keyboard implicitly enables its clock.
                self.state.config &= !CFG_KBD_DISABLE;
                self.state.keyboard.command(byte);
            }
        }
        self.fill_output();
    }
}

impl Device for Ps2Controller {
    fn name(&self) -> &str {
        "ps2"
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        match port {
            PS2_DATA => self.read_data() as u32,
            PS2_STATUS => self.status() as u32,
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        match port {
            PS2_DATA => self.write_data(value as u8),
            PS2_STATUS => self.write_command(value as u8),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.state = Ps2State::default();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(self.name(), &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(self.name())?;
        Ok(())
    }
}
