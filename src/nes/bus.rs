use tracing::debug;

use super::apu::Apu;
use super::cartridge::Cartridge;
use super::cpu::CpuBus;
use super::ppu::Ppu;

/// OAM DMA progress. `dummy` is the alignment wait before the first read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OamDma {
    pub(crate) page: u8,
    pub(crate) addr: u8,
    pub(crate) data: u8,
    pub(crate) transfer: bool,
    pub(crate) dummy: bool,
}

impl Default for OamDma {
    fn default() -> Self {
        Self {
            page: 0,
            addr: 0,
            data: 0,
            transfer: false,
            dummy: true,
        }
    }
}

/// Everything the CPU can reach through its address space.
pub struct SystemBus {
    pub(crate) ram: [u8; 2048],
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) cart: Option<Cartridge>,

    controller: [u8; 2],
    controller_shift: [u8; 2],
    pub(crate) dma: OamDma,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(),
            apu: Apu::new(),
            cart: None,
            controller: [0; 2],
            controller_shift: [0; 2],
            dma: OamDma::default(),
        }
    }

    /// Clears RAM, DMA and controller shift registers. Chips reset separately.
    pub(crate) fn reset(&mut self) {
        self.ram = [0; 2048];
        self.controller_shift = [0; 2];
        self.dma = OamDma::default();
    }

    pub(crate) fn set_controller_state(&mut self, player: usize, state: u8) {
        if let Some(slot) = self.controller.get_mut(player) {
            *slot = state;
        }
    }

    /// One DMA cycle. Reads land on even master ticks, OAM writes on odd.
    pub(crate) fn dma_cycle(&mut self, odd_tick: bool) {
        if self.dma.dummy {
            if odd_tick {
                self.dma.dummy = false;
            }
            return;
        }

        if !odd_tick {
            let addr = ((self.dma.page as u16) << 8) | self.dma.addr as u16;
            self.dma.data = self.read(addr);
        } else {
            self.ppu.write_oam_dma_byte(self.dma.addr, self.dma.data);
            self.dma.addr = self.dma.addr.wrapping_add(1);
            if self.dma.addr == 0 {
                self.dma.transfer = false;
                self.dma.dummy = true;
            }
        }
    }

    fn start_oam_dma(&mut self, page: u8) {
        self.dma.page = page;
        self.dma.addr = 0;
        self.dma.transfer = true;
        debug!(target: "dma", page = format_args!("${page:02X}"), "OAM DMA started");
    }

    fn read_controller(&mut self, port: usize) -> u8 {
        let bit = (self.controller_shift[port] & 0x80 != 0) as u8;
        self.controller_shift[port] <<= 1;
        bit
    }
}

impl CpuBus for SystemBus {
    fn read(&mut self, addr: u16) -> u8 {
        if let Some(value) = self.cart.as_ref().and_then(|cart| cart.cpu_read(addr)) {
            return value;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            0x2000..=0x3FFF => match self.cart.as_mut() {
                Some(cart) => self.ppu.cpu_read_register(addr, cart),
                None => 0,
            },
            0x4015 => self.apu.read_status(),
            0x4016 | 0x4017 => self.read_controller((addr & 0x0001) as usize),
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        if self.cart.as_mut().is_some_and(|cart| cart.cpu_write(addr, value)) {
            return;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize] = value,
            0x2000..=0x3FFF => {
                if let Some(cart) = self.cart.as_mut() {
                    self.ppu.cpu_write_register(addr, value, cart);
                }
            }
            0x4000..=0x4013 | 0x4015 => self.apu.write_register(addr, value),
            0x4014 => self.start_oam_dma(value),
            0x4016 => {
                // One strobe line feeds both ports.
                self.controller_shift = self.controller;
            }
            0x4017 => {
                self.apu.write_register(addr, value);
                self.controller_shift[1] = self.controller[1];
            }
            _ => {}
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        if let Some(value) = self.cart.as_ref().and_then(|cart| cart.cpu_read(addr)) {
            return value;
        }
        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            _ => 0,
        }
    }
}
