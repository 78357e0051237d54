//! # Legacy 8259 PIC Pair
//!
//! Master on ports `0x20/0x21`, slave on `0xA0/0xA1`, cascaded through master
//! line 2. After [`Pic8259::init`] the master raises vectors `0x20..0x28` and
//! the slave `0x28..0x30`, with every line masked.

use crate::controller::{ControllerKind, InterruptController};
use crate::port::PortIo;
use crate::vector::Vector;
use kernel_info::interrupts::{PIC_LINES, PIC_MASTER_BASE, PIC_SLAVE_BASE};
use kernel_status::{KResult, Status};
use kernel_sync::SpinMutex;

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_ICW4: u8 = 0x01;
const ICW1_INIT: u8 = 0x10;
const ICW4_8086: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;
const OCW3_READ_IRR: u8 = 0x0A;
const OCW3_READ_ISR: u8 = 0x0B;

/// Master line the slave is wired to.
const CASCADE_LINE: u8 = 2;

pub struct Pic8259<P: PortIo> {
    ports: SpinMutex<P>,
}

impl<P: PortIo> Pic8259<P> {
    pub const fn new(ports: P) -> Self {
        Self {
            ports: SpinMutex::new(ports),
        }
    }

    /// Remap both chips to the kernel's vector bases and mask every line.
    pub fn init(&self) {
        let p = self.ports.lock_irq();
        p.write_u8(MASTER_CMD, ICW1_INIT | ICW1_ICW4);
        p.write_u8(SLAVE_CMD, ICW1_INIT | ICW1_ICW4);
        p.write_u8(MASTER_DATA, PIC_MASTER_BASE);
        p.write_u8(SLAVE_DATA, PIC_SLAVE_BASE);
        p.write_u8(MASTER_DATA, 1 << CASCADE_LINE);
        p.write_u8(SLAVE_DATA, 2);
        p.write_u8(MASTER_DATA, ICW4_8086);
        p.write_u8(SLAVE_DATA, ICW4_8086);
        p.write_u8(MASTER_DATA, 0xFF);
        p.write_u8(SLAVE_DATA, 0xFF);
        log::debug!("pic: remapped to {PIC_MASTER_BASE:#x}/{PIC_SLAVE_BASE:#x}, all lines masked");
    }

    /// Combined mask, slave in the high byte. A set bit masks the line.
    pub fn mask(&self) -> u16 {
        let p = self.ports.lock_irq();
        u16::from_le_bytes([p.read_u8(MASTER_DATA), p.read_u8(SLAVE_DATA)])
    }

    pub fn set_mask(&self, mask: u16) {
        let [lo, hi] = mask.to_le_bytes();
        let p = self.ports.lock_irq();
        p.write_u8(MASTER_DATA, lo);
        p.write_u8(SLAVE_DATA, hi);
    }

    /// In-service register of both chips, slave in the high byte.
    pub fn in_service(&self) -> u16 {
        self.read_register(OCW3_READ_ISR)
    }

    /// Interrupt request register of both chips, slave in the high byte.
    pub fn requested(&self) -> u16 {
        self.read_register(OCW3_READ_IRR)
    }

    fn read_register(&self, ocw3: u8) -> u16 {
        let p = self.ports.lock_irq();
        p.write_u8(MASTER_CMD, ocw3);
        p.write_u8(SLAVE_CMD, ocw3);
        u16::from_le_bytes([p.read_u8(MASTER_CMD), p.read_u8(SLAVE_CMD)])
    }

    fn update_mask(&self, line: u8, masked: bool) -> KResult<()> {
        if line >= PIC_LINES {
            return Err(Status::BadInterruptVector);
        }
        let p = self.ports.lock_irq();
        let (port, bit) = if line < 8 {
            (MASTER_DATA, line)
        } else {
            (SLAVE_DATA, line - 8)
        };
        let old = p.read_u8(port);
        let new = if masked { old | (1 << bit) } else { old & !(1 << bit) };
        p.write_u8(port, new);
        if line >= 8 && !masked {
            let m = p.read_u8(MASTER_DATA);
            p.write_u8(MASTER_DATA, m & !(1 << CASCADE_LINE));
        }
        Ok(())
    }

    fn eoi(&self, line: u8) {
        let p = self.ports.lock_irq();
        if line >= 8 {
            p.write_u8(SLAVE_CMD, OCW2_EOI);
        }
        p.write_u8(MASTER_CMD, OCW2_EOI);
    }
}

impl<P: PortIo> InterruptController for Pic8259<P> {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Pic
    }

    fn vector_base(&self) -> u8 {
        PIC_MASTER_BASE
    }

    fn line_count(&self) -> u8 {
        PIC_LINES
    }

    fn spurious_vector(&self) -> Option<Vector> {
        None
    }

    fn enable(&self, line: u8) -> KResult<()> {
        self.update_mask(line, false)
    }

    fn disable(&self, line: u8) -> KResult<()> {
        self.update_mask(line, true)
    }

    fn acknowledge(&self, line: u8) {
        if line >= PIC_LINES {
            log::warn!("pic: EOI for nonexistent line {line}");
            return;
        }
        self.eoi(line);
    }

    fn is_spurious(&self, line: u8) -> bool {
        match line {
            7 | 15 if self.in_service() & (1 << line) == 0 => {
                // The master did see a real request on the cascade line.
                if line == 15 {
                    self.eoi(0);
                }
                log::trace!("pic: spurious IRQ {line}");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Chips {
        writes: Vec<(u16, u8)>,
        mask: [u8; 2],
        isr: [u8; 2],
        irr: [u8; 2],
        read_isr: [bool; 2],
        init_step: [u8; 2],
    }

    #[derive(Clone, Default)]
    struct FakePorts(Arc<Mutex<Chips>>);

    fn chip(port: u16) -> usize {
        usize::from(port >= 0xA0)
    }

    impl PortIo for FakePorts {
        fn read_u8(&self, port: u16) -> u8 {
            let c = self.0.lock().unwrap();
            let i = chip(port);
            match port & 1 {
                1 => c.mask[i],
                _ if c.read_isr[i] => c.isr[i],
                _ => c.irr[i],
            }
        }

        fn write_u8(&self, port: u16, value: u8) {
            let mut c = self.0.lock().unwrap();
            let i = chip(port);
            c.writes.push((port, value));
            match (port & 1, value) {
                (0, v) if v & ICW1_INIT != 0 => c.init_step[i] = 3,
                (0, OCW3_READ_ISR) => c.read_isr[i] = true,
                (0, OCW3_READ_IRR) => c.read_isr[i] = false,
                (1, _) if c.init_step[i] > 0 => c.init_step[i] -= 1,
                (1, v) => c.mask[i] = v,
                _ => {}
            }
        }
    }

    fn pic() -> (Pic8259<FakePorts>, FakePorts) {
        let ports = FakePorts::default();
        let pic = Pic8259::new(ports.clone());
        pic.init();
        ports.0.lock().unwrap().writes.clear();
        (pic, ports)
    }

    #[test]
    fn init_remaps_and_masks() {
        let ports = FakePorts::default();
        Pic8259::new(ports.clone()).init();
        let c = ports.0.lock().unwrap();
        assert_eq!(
            c.writes,
            vec![
                (0x20, 0x11),
                (0xA0, 0x11),
                (0x21, 0x20),
                (0xA1, 0x28),
                (0x21, 0x04),
                (0xA1, 0x02),
                (0x21, 0x01),
                (0xA1, 0x01),
                (0x21, 0xFF),
                (0xA1, 0xFF),
            ]
        );
        assert_eq!(c.mask, [0xFF, 0xFF]);
    }

    #[test]
    fn slave_line_unmasks_cascade() {
        let (pic, ports) = pic();
        pic.enable(1).unwrap();
        assert_eq!(pic.mask(), 0xFFFD);
        pic.enable(12).unwrap();
        assert_eq!(pic.mask(), 0xEFF9);
        pic.disable(12).unwrap();
        assert_eq!(pic.mask(), 0xFFF9);
        assert_eq!(pic.enable(16), Err(Status::BadInterruptVector));
        drop(ports);
    }

    #[test]
    fn eoi_goes_to_both_chips_for_slave_lines() {
        let (pic, ports) = pic();
        pic.acknowledge(3);
        pic.acknowledge(9);
        assert_eq!(
            ports.0.lock().unwrap().writes,
            vec![(0x20, 0x20), (0xA0, 0x20), (0x20, 0x20)]
        );
    }

    #[test]
    fn spurious_lines_are_detected_through_isr() {
        let (pic, ports) = pic();
        assert!(pic.is_spurious(7));
        ports.0.lock().unwrap().isr = [0x80, 0];
        assert!(!pic.is_spurious(7));
        assert!(!pic.is_spurious(3));

        ports.0.lock().unwrap().writes.clear();
        assert!(pic.is_spurious(15));
        // Spurious slave interrupt: the master still gets its EOI, the slave not.
        let writes = ports.0.lock().unwrap().writes.clone();
        assert!(writes.contains(&(0x20, 0x20)));
        assert!(!writes.contains(&(0xA0, 0x20)));

        ports.0.lock().unwrap().isr = [0x04, 0x80];
        assert!(!pic.is_spurious(15));
    }
}
