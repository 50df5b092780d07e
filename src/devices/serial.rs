//! 16550A UART emulation.
//!
//! Transmitted bytes go straight to a host writer (stdout by default), so the
//! transmitter is always empty. Received bytes come from [`Serial::push_input`]
//! and pass through a 16-byte FIFO with a programmable trigger level.
//! The interrupt output reaches the PIC only while MCR.OUT2 is set, as on PC
//! motherboards.

use std::collections::VecDeque;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccessWidth, Device, DeviceSnapshot, IrqLine, SnapshotError};

pub const COM1_BASE: u16 = 0x3F8;
pub const COM1_IRQ: u32 = 4;
pub const COM2_BASE: u16 = 0x2F8;
pub const COM2_IRQ: u32 = 3;

const FIFO_SIZE: usize = 16;

/// Register offsets from the base port.
mod regs {
    /// RBR (read) / THR (write); DLL when DLAB is set
    pub const DATA: u16 = 0;
    /// IER; DLM when DLAB is set
    pub const IER: u16 = 1;
    /// IIR (read) / FCR (write)
    pub const IIR_FCR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
    pub const MSR: u16 = 6;
    pub const SCR: u16 = 7;
}

mod ier {
    pub const RX_DATA: u8 = 0x01;
    pub const THRE: u8 = 0x02;
    pub const LINE_STATUS: u8 = 0x04;
    pub const MODEM_STATUS: u8 = 0x08;
}

mod iir {
    pub const NONE: u8 = 0x01;
    pub const MODEM_STATUS: u8 = 0x00;
    pub const THRE: u8 = 0x02;
    pub const RX_DATA: u8 = 0x04;
    pub const LINE_STATUS: u8 = 0x06;
    pub const RX_TIMEOUT: u8 = 0x0C;
    pub const FIFO_ENABLED: u8 = 0xC0;
}

mod lsr {
    pub const DR: u8 = 0x01;
    pub const OE: u8 = 0x02;
    pub const THRE: u8 = 0x20;
    pub const TEMT: u8 = 0x40;
}

mod mcr {
    pub const DTR: u8 = 0x01;
    pub const RTS: u8 = 0x02;
    pub const OUT1: u8 = 0x04;
    pub const OUT2: u8 = 0x08;
    pub const LOOP: u8 = 0x10;
}

mod msr {
    pub const DELTA_MASK: u8 = 0x0F;
    pub const CTS: u8 = 0x10;
    pub const DSR: u8 = 0x20;
    pub const RI: u8 = 0x40;
    pub const DCD: u8 = 0x80;
}

const LCR_DLAB: u8 = 0x80;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UartState {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
    fifo_enabled: bool,
    trigger: usize,
    overrun: bool,
    /// Modem status lines in bits 7:4, deltas in bits 3:0.
    msr: u8,
    rx: VecDeque<u8>,
    thre_pending: bool,
    rx_timeout: bool,
}

impl Default for UartState {
    fn default() -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            // 115200 baud
            dll: 1,
            dlm: 0,
            fifo_enabled: false,
            trigger: 1,
            overrun: false,
            msr: msr::DCD | msr::DSR | msr::CTS,
            rx: VecDeque::new(),
            thre_pending: false,
            rx_timeout: false,
        }
    }
}

/// 16550A UART.
pub struct Serial {
    name: String,
    base: u16,
    state: UartState,
    irq: IrqLine,
    irq_level: bool,
    out: Box<dyn Write + Send>,
}

impl Serial {
    /// UART at `base` writing transmitted bytes to stdout.
    pub fn new(base: u16, irq: IrqLine) -> Self {
        Self::with_writer(base, irq, Box::new(io::stdout()))
    }

    pub fn with_writer(base: u16, irq: IrqLine, out: Box<dyn Write + Send>) -> Self {
        Self {
            name: format!("serial@{:#x}", base),
            base,
            state: UartState::default(),
            irq,
            irq_level: false,
            out,
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Divisor latch value; baud rate is 115200 / divisor.
    pub fn divisor(&self) -> u16 {
        u16::from_le_bytes([self.state.dll, self.state.dlm])
    }

    /// Queue host input for the guest. Bytes beyond FIFO capacity set the
    /// overrun flag and are lost.
    pub fn push_input(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.receive(b);
        }
        // The burst ends here; report a character timeout if the FIFO holds
        // data below its trigger level.
        self.state.rx_timeout = self.state.fifo_enabled && !self.state.rx.is_empty();
        self.update_irq();
    }

    fn receive(&mut self, byte: u8) {
        let capacity = if self.state.fifo_enabled { FIFO_SIZE } else { 1 };
        if self.state.rx.len() >= capacity {
            self.state.overrun = true;
            return;
        }
        self.state.rx.push_back(byte);
    }

    fn transmit(&mut self, byte: u8) {
        if self.state.mcr & mcr::LOOP != 0 {
            self.receive(byte);
        } else {
            let result = self.out.write_all(&[byte]).and_then(|_| self.out.flush());
            if let Err(e) = result {
                debug!("{}: output error: {}", self.name, e);
            }
        }
        self.state.thre_pending = true;
    }

    fn lsr(&self) -> u8 {
        let mut value = lsr::THRE | lsr::TEMT;
        if !self.state.rx.is_empty() {
            value |= lsr::DR;
        }
        if self.state.overrun {
            value |= lsr::OE;
        }
        value
    }

    fn rx_ready(&self) -> bool {
        let s = &self.state;
        !s.rx.is_empty() && (!s.fifo_enabled || s.rx.len() >= s.trigger)
    }

    /// Highest-priority pending interrupt identification.
    fn interrupt_id(&self) -> u8 {
        let s = &self.state;
        if s.ier & ier::LINE_STATUS != 0 && s.overrun {
            iir::LINE_STATUS
        } else if s.ier & ier::RX_DATA != 0 && self.rx_ready() {
            iir::RX_DATA
        } else if s.ier & ier::RX_DATA != 0 && s.rx_timeout && !s.rx.is_empty() {
            iir::RX_TIMEOUT
        } else if s.ier & ier::THRE != 0 && s.thre_pending {
            iir::THRE
        } else if s.ier & ier::MODEM_STATUS != 0 && s.msr & msr::DELTA_MASK != 0 {
            iir::MODEM_STATUS
        } else {
            iir::NONE
        }
    }

    fn update_irq(&mut self) {
        let level = self.interrupt_id() != iir::NONE && self.state.mcr & mcr::OUT2 != 0;
        if level != self.irq_level {
            self.irq_level = level;
            self.irq.set_level(level);
        }
    }

    /// Modem status inputs for the current MCR.
    fn modem_lines(&self) -> u8 {
        let m = self.state.mcr;
        if m & mcr::LOOP == 0 {
            return msr::DCD | msr::DSR | msr::CTS;
        }
        let mut lines = 0;
        if m & mcr::RTS != 0 {
            lines |= msr::CTS;
        }
        if m & mcr::DTR != 0 {
            lines |= msr::DSR;
        }
        if m & mcr::OUT1 != 0 {
            lines |= msr::RI;
        }
        if m & mcr::OUT2 != 0 {
            lines |= msr::DCD;
        }
        lines
    }

    fn write_mcr(&mut self, value: u8) {
        self.state.mcr = value & 0x1F;
        let old = self.state.msr & 0xF0;
        let new = self.modem_lines();
        let changed = old ^ new;
        let mut delta = self.state.msr & msr::DELTA_MASK;
        if changed & msr::CTS != 0 {
            delta |= 0x01;
        }
        if changed & msr::DSR != 0 {
            delta |= 0x02;
        }
        // Trailing edge of RI only.
        if old & msr::RI != 0 && new & msr::RI == 0 {
            delta |= 0x04;
        }
        if changed & msr::DCD != 0 {
            delta |= 0x08;
        }
        self.state.msr = new | delta;
    }

    fn write_fcr(&mut self, value: u8) {
        let enable = value & 0x01 != 0;
        if enable != self.state.fifo_enabled {
            self.state.rx.clear();
        }
        self.state.fifo_enabled = enable;
        if value & 0x02 != 0 {
            self.state.rx.clear();
            self.state.rx_timeout = false;
        }
        self.state.trigger = match value >> 6 {
            0 => 1,
            1 => 4,
            2 => 8,
            _ => 14,
        };
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        let dlab = self.state.lcr & LCR_DLAB != 0;
        match offset {
            regs::DATA if dlab => self.state.dll,
            regs::DATA => {
                let byte = self.state.rx.pop_front().unwrap_or(0);
                self.state.rx_timeout = false;
                byte
            }
            regs::IER if dlab => self.state.dlm,
            regs::IER => self.state.ier,
            regs::IIR_FCR => {
                let id = self.interrupt_id();
                // Reading IIR acknowledges a THRE interrupt.
                if id == iir::THRE {
                    self.state.thre_pending = false;
                }
                let fifo = if self.state.fifo_enabled { iir::FIFO_ENABLED } else { 0 };
                id | fifo
            }
            regs::LCR => self.state.lcr,
            regs::MCR => self.state.mcr,
            regs::LSR => {
                let value = self.lsr();
                self.state.overrun = false;
                value
            }
            regs::MSR => {
                let value = self.state.msr;
                self.state.msr &= !msr::DELTA_MASK;
                value
            }
            regs::SCR => self.state.scr,
            _ => 0xFF,
        }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        let dlab = self.state.lcr & LCR_DLAB != 0;
        match offset {
            regs::DATA if dlab => self.state.dll = value,
            regs::DATA => self.transmit(value),
            regs::IER if dlab => self.state.dlm = value,
            regs::IER => {
                let old = self.state.ier;
                self.state.ier = value & 0x0F;
                // Enabling THRE while the holding register is empty interrupts.
                if old & ier::THRE == 0 && value & ier::THRE != 0 {
                    self.state.thre_pending = true;
                }
            }
            regs::IIR_FCR => self.write_fcr(value),
            regs::LCR => self.state.lcr = value,
            regs::MCR => self.write_mcr(value),
            regs::SCR => self.state.scr = value,
            _ => {}
        }
    }
}

impl Device for Serial {
    fn name(&self) -> &str {
        &self.name
    }

    fn io_read(&mut self, port: u16, _width: AccessWidth) -> u32 {
        let value = self.read_reg(port.wrapping_sub(self.base));
        self.update_irq();
        value as u32
    }

    fn io_write(&mut self, port: u16, _width: AccessWidth, value: u32) {
        self.write_reg(port.wrapping_sub(self.base), value as u8);
        self.update_irq();
    }

    fn reset(&mut self) {
        self.state = UartState::default();
        self.update_irq();
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::capture(&self.name, &self.state)
    }

    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        self.state = snapshot.decode(&self.name)?;
        self.update_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::recording_line;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn uart() -> (Serial, SharedBuf) {
        let buf = SharedBuf::default();
        let serial = Serial::with_writer(
            COM1_BASE,
            IrqLine::disconnected(COM1_IRQ),
            Box::new(buf.clone()),
        );
        (serial, buf)
    }

    fn rd(s: &mut Serial, reg: u16) -> u8 {
        s.io_read(COM1_BASE + reg, AccessWidth::Byte) as u8
    }

    fn wr(s: &mut Serial, reg: u16, value: u8) {
        s.io_write(COM1_BASE + reg, AccessWidth::Byte, value as u32);
    }

    #[test]
    fn test_lsr_transmitter_always_empty() {
        let (mut s, _) = uart();
        let lsr = rd(&mut s, regs::LSR);
        assert_eq!(lsr & (lsr::THRE | lsr::TEMT), lsr::THRE | lsr::TEMT);
        assert_eq!(lsr & lsr::DR, 0);
    }

    #[test]
    fn test_transmit_reaches_writer() {
        let (mut s, buf) = uart();
        for &b in b"ok\n" {
            wr(&mut s, regs::DATA, b);
        }
        assert_eq!(buf.0.lock().unwrap().as_slice(), b"ok\n");
    }

    #[test]
    fn test_scratch_register() {
        let (mut s, _) = uart();
        wr(&mut s, regs::SCR, 0x42);
        assert_eq!(rd(&mut s, regs::SCR), 0x42);
    }

    #[test]
    fn test_dlab_aliasing() {
        let (mut s, buf) = uart();
        wr(&mut s, regs::IER, 0x05);
        wr(&mut s, regs::LCR, 0x83);
        wr(&mut s, regs::DATA, 0x0C);
        wr(&mut s, regs::IER, 0x00);
        assert_eq!(s.divisor(), 12);
        assert_eq!(rd(&mut s, regs::DATA), 0x0C);
        wr(&mut s, regs::LCR, 0x03);
        assert_eq!(rd(&mut s, regs::IER), 0x05);
        assert!(buf.0.lock().unwrap().is_empty(), "divisor write is not data");
    }

    #[test]
    fn test_input_and_rx_interrupt_gated_by_out2() {
        let (line, sink) = recording_line(COM1_IRQ);
        let mut s = Serial::with_writer(COM1_BASE, line, Box::new(io::sink()));
        wr(&mut s, regs::IER, ier::RX_DATA);
        s.push_input(b"a");
        assert!(!sink.level(COM1_IRQ), "OUT2 clear");

        wr(&mut s, regs::MCR, mcr::OUT2);
        assert!(sink.level(COM1_IRQ));
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::RX_DATA);
        assert_eq!(rd(&mut s, regs::DATA), b'a');
        assert!(!sink.level(COM1_IRQ));
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::NONE);
    }

    #[test]
    fn test_thre_interrupt_cleared_by_iir_read() {
        let (mut s, _) = uart();
        wr(&mut s, regs::IER, ier::THRE);
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::THRE);
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::NONE);
        wr(&mut s, regs::DATA, b'x');
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::THRE);
    }

    #[test]
    fn test_fifo_trigger_and_timeout() {
        let (mut s, _) = uart();
        wr(&mut s, regs::IIR_FCR, 0x81); // enable, trigger 8
        wr(&mut s, regs::IER, ier::RX_DATA);
        s.push_input(b"abc");
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::FIFO_ENABLED | iir::RX_TIMEOUT);
        s.push_input(b"defgh");
        assert_eq!(rd(&mut s, regs::IIR_FCR), iir::FIFO_ENABLED | iir::RX_DATA);
        let got: Vec<u8> = (0..8).map(|_| rd(&mut s, regs::DATA)).collect();
        assert_eq!(got, b"abcdefgh");
    }

    #[test]
    fn test_overrun() {
        let (mut s, _) = uart();
        s.push_input(b"xy");
        assert_eq!(rd(&mut s, regs::LSR) & (lsr::OE | lsr::DR), lsr::OE | lsr::DR);
        assert_eq!(rd(&mut s, regs::LSR) & lsr::OE, 0);
        assert_eq!(rd(&mut s, regs::DATA), b'x');
    }

    #[test]
    fn test_loopback() {
        let (mut s, buf) = uart();
        wr(&mut s, regs::MCR, mcr::LOOP | mcr::RTS | mcr::DTR);
        wr(&mut s, regs::DATA, 0x5A);
        assert_eq!(rd(&mut s, regs::DATA), 0x5A);
        assert!(buf.0.lock().unwrap().is_empty());
        let status = rd(&mut s, regs::MSR);
        assert_eq!(status & 0xF0, msr::CTS | msr::DSR);
        // DCD dropped relative to the default lines.
        assert_eq!(status & msr::DELTA_MASK, 0x08);
        assert_eq!(rd(&mut s, regs::MSR) & msr::DELTA_MASK, 0);
    }
}
