use anyhow::{Result, bail};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLow,
    OneScreenHigh,
    /// No override; the cartridge header decides.
    Hardware,
}

/// Result of asking a mapper to translate a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedRead {
    Unmapped,
    /// Offset into PRG or CHR memory, before wrapping.
    Offset(usize),
    /// The mapper produced the byte itself (static RAM).
    Data(u8),
}

/// Result of asking a mapper to translate a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedWrite {
    Unmapped,
    Offset(usize),
    /// Consumed by the mapper: a register write, static RAM, or a write to ROM.
    Handled,
}

pub trait Mapper: Send {
    fn cpu_map_read(&self, addr: u16) -> MappedRead;
    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite;
    fn ppu_map_read(&self, addr: u16) -> MappedRead;
    fn ppu_map_write(&mut self, addr: u16) -> MappedWrite;
    fn mirroring(&self) -> Mirroring {
        Mirroring::Hardware
    }
    fn irq_state(&self) -> bool {
        false
    }
    fn irq_clear(&mut self) {}
    fn on_scanline(&mut self) {}
    fn reset(&mut self);
    fn battery_ram(&self) -> Option<&[u8]> {
        None
    }
    fn battery_ram_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
    fn debug_state(&self) -> String {
        String::new()
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        66 => "GxROM",
        _ => "Unsupported",
    }
}

pub fn create_mapper(mapper_id: u16, prg_banks: usize, chr_banks: usize) -> Result<Box<dyn Mapper>> {
    let mut mapper: Box<dyn Mapper> = match mapper_id {
        0 => Box::new(Mapper0::new(prg_banks, chr_banks)),
        1 => Box::new(Mapper1::new(prg_banks, chr_banks)),
        2 => Box::new(Mapper2::new(prg_banks, chr_banks)),
        3 => Box::new(Mapper3::new(prg_banks, chr_banks)),
        4 => Box::new(Mapper4::new(prg_banks, chr_banks)),
        66 => Box::new(Mapper66::new(prg_banks, chr_banks)),
        id => bail!("unsupported mapper {id}"),
    };
    mapper.reset();
    Ok(mapper)
}

const STATIC_RAM_SIZE: usize = 32 * 1024;

fn nrom_prg_offset(addr: u16, prg_banks: usize) -> usize {
    let mask = if prg_banks > 1 { 0x7FFF } else { 0x3FFF };
    (addr & mask) as usize
}

struct Mapper0 {
    prg_banks: usize,
    chr_banks: usize,
}

impl Mapper0 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
        }
    }
}

impl Mapper for Mapper0 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        if addr >= 0x8000 {
            MappedRead::Offset(nrom_prg_offset(addr, self.prg_banks))
        } else {
            MappedRead::Unmapped
        }
    }

    fn cpu_map_write(&mut self, addr: u16, _value: u8) -> MappedWrite {
        if addr >= 0x8000 {
            MappedWrite::Handled
        } else {
            MappedWrite::Unmapped
        }
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr < 0x2000 {
            MappedRead::Offset(addr as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn ppu_map_write(&mut self, addr: u16) -> MappedWrite {
        if addr < 0x2000 && self.chr_banks == 0 {
            MappedWrite::Offset(addr as usize)
        } else {
            MappedWrite::Unmapped
        }
    }

    fn reset(&mut self) {}
}

struct Mapper1 {
    prg_banks: usize,
    chr_banks: usize,
    static_ram: Vec<u8>,

    load_register: u8,
    load_count: u8,
    control: u8,
    mirroring: Mirroring,
    chr_bank_4k_lo: u8,
    chr_bank_4k_hi: u8,
    chr_bank_8k: u8,
    prg_bank_16k_lo: u8,
    prg_bank_16k_hi: u8,
    prg_bank_32k: u8,
}

impl Mapper1 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            static_ram: vec![0; STATIC_RAM_SIZE],
            load_register: 0,
            load_count: 0,
            control: 0x1C,
            mirroring: Mirroring::Horizontal,
            chr_bank_4k_lo: 0,
            chr_bank_4k_hi: 0,
            chr_bank_8k: 0,
            prg_bank_16k_lo: 0,
            prg_bank_16k_hi: 0,
            prg_bank_32k: 0,
        }
    }

    fn commit(&mut self, addr: u16) {
        let data = self.load_register;
        match (addr >> 13) & 0x03 {
            0 => {
                self.control = data & 0x1F;
                self.mirroring = match self.control & 0x03 {
                    0 => Mirroring::OneScreenLow,
                    1 => Mirroring::OneScreenHigh,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                };
            }
            1 => {
                if self.control & 0x10 != 0 {
                    self.chr_bank_4k_lo = data & 0x1F;
                } else {
                    // 8K mode ignores the low bit of the 4K bank number.
                    self.chr_bank_8k = (data & 0x1E) >> 1;
                }
            }
            2 => {
                if self.control & 0x10 != 0 {
                    self.chr_bank_4k_hi = data & 0x1F;
                }
            }
            _ => match (self.control >> 2) & 0x03 {
                0 | 1 => self.prg_bank_32k = (data & 0x0E) >> 1,
                2 => {
                    self.prg_bank_16k_lo = 0;
                    self.prg_bank_16k_hi = data & 0x0F;
                }
                _ => {
                    self.prg_bank_16k_lo = data & 0x0F;
                    self.prg_bank_16k_hi = self.last_prg_bank();
                }
            },
        }
        debug!(target: "mapper", register = (addr >> 13) & 0x03, data, "MMC1 register commit");
    }

    fn last_prg_bank(&self) -> u8 {
        self.prg_banks.saturating_sub(1) as u8
    }
}

impl Mapper for Mapper1 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        match addr {
            0x6000..=0x7FFF => MappedRead::Data(self.static_ram[(addr & 0x1FFF) as usize]),
            0x8000..=0xFFFF => {
                if self.control & 0x08 != 0 {
                    let bank = if addr < 0xC000 {
                        self.prg_bank_16k_lo
                    } else {
                        self.prg_bank_16k_hi
                    };
                    MappedRead::Offset(bank as usize * 0x4000 + (addr & 0x3FFF) as usize)
                } else {
                    MappedRead::Offset(
                        self.prg_bank_32k as usize * 0x8000 + (addr & 0x7FFF) as usize,
                    )
                }
            }
            _ => MappedRead::Unmapped,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite {
        match addr {
            0x6000..=0x7FFF => {
                self.static_ram[(addr & 0x1FFF) as usize] = value;
                MappedWrite::Handled
            }
            0x8000..=0xFFFF => {
                if value & 0x80 != 0 {
                    self.load_register = 0;
                    self.load_count = 0;
                    self.control |= 0x0C;
                } else {
                    self.load_register >>= 1;
                    self.load_register |= (value & 0x01) << 4;
                    self.load_count += 1;
                    if self.load_count == 5 {
                        self.commit(addr);
                        self.load_register = 0;
                        self.load_count = 0;
                    }
                }
                MappedWrite::Handled
            }
            _ => MappedWrite::Unmapped,
        }
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr >= 0x2000 {
            return MappedRead::Unmapped;
        }
        if self.chr_banks == 0 {
            return MappedRead::Offset(addr as usize);
        }
        let offset = if self.control & 0x10 != 0 {
            let bank = if addr < 0x1000 {
                self.chr_bank_4k_lo
            } else {
                self.chr_bank_4k_hi
            };
            bank as usize * 0x1000 + (addr & 0x0FFF) as usize
        } else {
            self.chr_bank_8k as usize * 0x2000 + (addr & 0x1FFF) as usize
        };
        MappedRead::Offset(offset)
    }

    fn ppu_map_write(&mut self, addr: u16) -> MappedWrite {
        match addr {
            0x0000..=0x1FFF if self.chr_banks == 0 => MappedWrite::Offset(addr as usize),
            0x0000..=0x1FFF => MappedWrite::Handled,
            _ => MappedWrite::Unmapped,
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn reset(&mut self) {
        self.control = 0x1C;
        self.load_register = 0;
        self.load_count = 0;
        self.chr_bank_4k_lo = 0;
        self.chr_bank_4k_hi = 0;
        self.chr_bank_8k = 0;
        self.prg_bank_32k = 0;
        self.prg_bank_16k_lo = 0;
        self.prg_bank_16k_hi = self.last_prg_bank();
    }

    fn battery_ram(&self) -> Option<&[u8]> {
        Some(&self.static_ram)
    }

    fn battery_ram_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.static_ram)
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC1 control=${:02X} load=${:02X}/{} prg32={} prg16=[{},{}] chr4=[{},{}] chr8={}",
            self.control,
            self.load_register,
            self.load_count,
            self.prg_bank_32k,
            self.prg_bank_16k_lo,
            self.prg_bank_16k_hi,
            self.chr_bank_4k_lo,
            self.chr_bank_4k_hi,
            self.chr_bank_8k
        )
    }
}

struct Mapper2 {
    prg_banks: usize,
    chr_banks: usize,
    prg_bank_lo: u8,
}

impl Mapper2 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            prg_bank_lo: 0,
        }
    }
}

impl Mapper for Mapper2 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        match addr {
            0x8000..=0xBFFF => {
                MappedRead::Offset(self.prg_bank_lo as usize * 0x4000 + (addr & 0x3FFF) as usize)
            }
            0xC000..=0xFFFF => {
                let last = self.prg_banks.saturating_sub(1);
                MappedRead::Offset(last * 0x4000 + (addr & 0x3FFF) as usize)
            }
            _ => MappedRead::Unmapped,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite {
        if addr >= 0x8000 {
            self.prg_bank_lo = value & 0x0F;
            MappedWrite::Handled
        } else {
            MappedWrite::Unmapped
        }
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr < 0x2000 {
            MappedRead::Offset(addr as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn ppu_map_write(&mut self, addr: u16) -> MappedWrite {
        if addr < 0x2000 && self.chr_banks == 0 {
            MappedWrite::Offset(addr as usize)
        } else {
            MappedWrite::Unmapped
        }
    }

    fn reset(&mut self) {
        self.prg_bank_lo = 0;
    }

    fn debug_state(&self) -> String {
        format!("UxROM prg_lo={}", self.prg_bank_lo)
    }
}

struct Mapper3 {
    prg_banks: usize,
    chr_bank: u8,
}

impl Mapper3 {
    fn new(prg_banks: usize, _chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_bank: 0,
        }
    }
}

impl Mapper for Mapper3 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        if addr >= 0x8000 {
            MappedRead::Offset(nrom_prg_offset(addr, self.prg_banks))
        } else {
            MappedRead::Unmapped
        }
    }

    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite {
        if addr >= 0x8000 {
            self.chr_bank = value & 0x03;
            MappedWrite::Handled
        } else {
            MappedWrite::Unmapped
        }
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr < 0x2000 {
            MappedRead::Offset(self.chr_bank as usize * 0x2000 + addr as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn ppu_map_write(&mut self, _addr: u16) -> MappedWrite {
        MappedWrite::Unmapped
    }

    fn reset(&mut self) {
        self.chr_bank = 0;
    }

    fn debug_state(&self) -> String {
        format!("CNROM chr={}", self.chr_bank)
    }
}

struct Mapper4 {
    prg_banks: usize,
    static_ram: Vec<u8>,

    target_register: u8,
    prg_bank_mode: bool,
    chr_inversion: bool,
    registers: [u8; 8],
    mirroring: Mirroring,

    irq_enabled: bool,
    irq_active: bool,
    irq_counter: u16,
    irq_reload: u16,
}

impl Mapper4 {
    fn new(prg_banks: usize, _chr_banks: usize) -> Self {
        Self {
            prg_banks,
            static_ram: vec![0; STATIC_RAM_SIZE],
            target_register: 0,
            prg_bank_mode: false,
            chr_inversion: false,
            registers: [0; 8],
            mirroring: Mirroring::Horizontal,
            irq_enabled: false,
            irq_active: false,
            irq_counter: 0,
            irq_reload: 0,
        }
    }

    fn prg_bank_8k(&self, slot: usize) -> usize {
        let second_last = (self.prg_banks * 2).saturating_sub(2);
        let last = (self.prg_banks * 2).saturating_sub(1);
        let switchable = (self.registers[6] & 0x3F) as usize;
        match (slot, self.prg_bank_mode) {
            (0, false) | (2, true) => switchable,
            (0, true) | (2, false) => second_last,
            (1, _) => (self.registers[7] & 0x3F) as usize,
            _ => last,
        }
    }

    fn chr_bank_1k(&self, slot: usize) -> usize {
        let r = &self.registers;
        let banks = [
            r[0] & 0xFE,
            r[0] | 0x01,
            r[1] & 0xFE,
            r[1] | 0x01,
            r[2],
            r[3],
            r[4],
            r[5],
        ];
        let slot = if self.chr_inversion { slot ^ 0x04 } else { slot };
        banks[slot] as usize
    }
}

impl Mapper for Mapper4 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        match addr {
            0x6000..=0x7FFF => MappedRead::Data(self.static_ram[(addr & 0x1FFF) as usize]),
            0x8000..=0xFFFF => {
                let slot = ((addr - 0x8000) >> 13) as usize;
                MappedRead::Offset(self.prg_bank_8k(slot) * 0x2000 + (addr & 0x1FFF) as usize)
            }
            _ => MappedRead::Unmapped,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite {
        let even = addr & 0x0001 == 0;
        match addr {
            0x6000..=0x7FFF => {
                self.static_ram[(addr & 0x1FFF) as usize] = value;
            }
            0x8000..=0x9FFF => {
                if even {
                    self.target_register = value & 0x07;
                    self.prg_bank_mode = value & 0x40 != 0;
                    self.chr_inversion = value & 0x80 != 0;
                } else {
                    self.registers[self.target_register as usize] = value;
                    debug!(target: "mapper", register = self.target_register, value, "MMC3 bank data");
                }
            }
            0xA000..=0xBFFF => {
                // Odd addresses select PRG RAM protection, which is not modelled.
                if even {
                    self.mirroring = if value & 0x01 != 0 {
                        Mirroring::Horizontal
                    } else {
                        Mirroring::Vertical
                    };
                }
            }
            0xC000..=0xDFFF => {
                if even {
                    self.irq_reload = value as u16;
                } else {
                    self.irq_counter = 0;
                }
            }
            0xE000..=0xFFFF => {
                if even {
                    self.irq_enabled = false;
                    self.irq_active = false;
                } else {
                    self.irq_enabled = true;
                }
            }
            _ => return MappedWrite::Unmapped,
        }
        MappedWrite::Handled
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr < 0x2000 {
            let slot = (addr >> 10) as usize;
            MappedRead::Offset(self.chr_bank_1k(slot) * 0x0400 + (addr & 0x03FF) as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn ppu_map_write(&mut self, _addr: u16) -> MappedWrite {
        MappedWrite::Unmapped
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn irq_state(&self) -> bool {
        self.irq_active
    }

    fn irq_clear(&mut self) {
        self.irq_active = false;
    }

    fn on_scanline(&mut self) {
        if self.irq_counter == 0 {
            self.irq_counter = self.irq_reload;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            self.irq_active = true;
        }
    }

    fn reset(&mut self) {
        self.target_register = 0;
        self.prg_bank_mode = false;
        self.chr_inversion = false;
        self.mirroring = Mirroring::Horizontal;
        self.irq_active = false;
        self.irq_enabled = false;
        self.irq_counter = 0;
        self.irq_reload = 0;
        self.registers = [0; 8];
        // Power-on PRG layout: 0, 1, second-last, last.
        self.registers[7] = 1;
    }

    fn battery_ram(&self) -> Option<&[u8]> {
        Some(&self.static_ram)
    }

    fn battery_ram_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.static_ram)
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC3 target={} prg_mode={} chr_inv={} regs={:02X?} irq_latch={} irq_counter={} en={} active={}",
            self.target_register,
            self.prg_bank_mode,
            self.chr_inversion,
            self.registers,
            self.irq_reload,
            self.irq_counter,
            self.irq_enabled,
            self.irq_active
        )
    }
}

struct Mapper66 {
    prg_bank: u8,
    chr_bank: u8,
}

impl Mapper66 {
    fn new(_prg_banks: usize, _chr_banks: usize) -> Self {
        Self {
            prg_bank: 0,
            chr_bank: 0,
        }
    }
}

impl Mapper for Mapper66 {
    fn cpu_map_read(&self, addr: u16) -> MappedRead {
        if addr >= 0x8000 {
            MappedRead::Offset(self.prg_bank as usize * 0x8000 + (addr & 0x7FFF) as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn cpu_map_write(&mut self, addr: u16, value: u8) -> MappedWrite {
        if addr >= 0x8000 {
            self.chr_bank = value & 0x03;
            self.prg_bank = (value & 0x30) >> 4;
            MappedWrite::Handled
        } else {
            MappedWrite::Unmapped
        }
    }

    fn ppu_map_read(&self, addr: u16) -> MappedRead {
        if addr < 0x2000 {
            MappedRead::Offset(self.chr_bank as usize * 0x2000 + addr as usize)
        } else {
            MappedRead::Unmapped
        }
    }

    fn ppu_map_write(&mut self, _addr: u16) -> MappedWrite {
        MappedWrite::Unmapped
    }

    fn reset(&mut self) {
        self.prg_bank = 0;
        self.chr_bank = 0;
    }

    fn debug_state(&self) -> String {
        format!("GxROM prg={} chr={}", self.prg_bank, self.chr_bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(read: MappedRead) -> usize {
        match read {
            MappedRead::Offset(offset) => offset,
            other => panic!("expected an offset, got {other:?}"),
        }
    }

    fn mmc1_serial_write(mapper: &mut dyn Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.cpu_map_write(addr, (value >> bit) & 0x01);
        }
    }

    #[test]
    fn mapper0_mirrors_single_bank() {
        let mapper = create_mapper(0, 1, 1).unwrap();
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 0x0000);
        assert_eq!(offset(mapper.cpu_map_read(0xC123)), 0x0123);
        assert_eq!(offset(mapper.cpu_map_read(0xFFFF)), 0x3FFF);
    }

    #[test]
    fn mapper0_maps_two_banks_linearly() {
        let mapper = create_mapper(0, 2, 1).unwrap();
        assert_eq!(offset(mapper.cpu_map_read(0xC123)), 0x4123);
        assert_eq!(mapper.cpu_map_read(0x6000), MappedRead::Unmapped);
    }

    #[test]
    fn mapper0_chr_ram_only_when_no_chr_banks() {
        let mut rom = create_mapper(0, 1, 1).unwrap();
        assert_eq!(rom.ppu_map_write(0x0010), MappedWrite::Unmapped);
        let mut ram = create_mapper(0, 1, 0).unwrap();
        assert_eq!(ram.ppu_map_write(0x0010), MappedWrite::Offset(0x0010));
    }

    #[test]
    fn mapper1_shift_register_programs_prg_bank() {
        let mut mapper = create_mapper(1, 4, 1).unwrap();

        // Reset state is 16K mode with the last bank fixed high.
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 3 * 0x4000);

        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x01);
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 0x4000);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 3 * 0x4000);
    }

    #[test]
    fn mapper1_control_selects_mirroring_and_reset_bit_restores_mode() {
        let mut mapper = create_mapper(1, 2, 2).unwrap();
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x02);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 0x4000);

        mapper.cpu_map_write(0x8000, 0x80);
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x01 | 0x10);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenHigh);
    }

    #[test]
    fn mapper1_chr_4k_banks() {
        let mut mapper = create_mapper(1, 2, 4).unwrap();
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x1F);
        mmc1_serial_write(mapper.as_mut(), 0xA000, 0x03);
        mmc1_serial_write(mapper.as_mut(), 0xC000, 0x05);
        assert_eq!(offset(mapper.ppu_map_read(0x0010)), 3 * 0x1000 + 0x10);
        assert_eq!(offset(mapper.ppu_map_read(0x1010)), 5 * 0x1000 + 0x10);
    }

    #[test]
    fn mapper1_static_ram_is_battery_ram() {
        let mut mapper = create_mapper(1, 2, 1).unwrap();
        assert_eq!(mapper.cpu_map_write(0x6002, 0x5A), MappedWrite::Handled);
        assert_eq!(mapper.cpu_map_read(0x6002), MappedRead::Data(0x5A));
        assert_eq!(mapper.battery_ram().map(|ram| ram[2]), Some(0x5A));
    }

    #[test]
    fn mapper2_keeps_last_bank_fixed() {
        let mut mapper = create_mapper(2, 3, 0).unwrap();
        mapper.cpu_map_write(0x8000, 1);
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 0x4000);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 2 * 0x4000);
    }

    #[test]
    fn mapper3_switches_chr_bank() {
        let mut mapper = create_mapper(3, 2, 4).unwrap();
        mapper.cpu_map_write(0x8000, 0x02);
        assert_eq!(offset(mapper.ppu_map_read(0x0004)), 2 * 0x2000 + 4);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 0x4000);
    }

    #[test]
    fn mapper4_prg_mode_swaps_fixed_window() {
        let mut mapper = create_mapper(4, 4, 8).unwrap();
        mapper.cpu_map_write(0x8000, 0x06);
        mapper.cpu_map_write(0x8001, 0x02);
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 2 * 0x2000);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 6 * 0x2000);
        assert_eq!(offset(mapper.cpu_map_read(0xE000)), 7 * 0x2000);

        mapper.cpu_map_write(0x8000, 0x46);
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 6 * 0x2000);
        assert_eq!(offset(mapper.cpu_map_read(0xC000)), 2 * 0x2000);
    }

    #[test]
    fn mapper4_chr_inversion() {
        let mut mapper = create_mapper(4, 2, 8).unwrap();
        mapper.cpu_map_write(0x8000, 0x00);
        mapper.cpu_map_write(0x8001, 0x04);
        mapper.cpu_map_write(0x8000, 0x02);
        mapper.cpu_map_write(0x8001, 0x09);
        assert_eq!(offset(mapper.ppu_map_read(0x0400)), 5 * 0x0400);
        assert_eq!(offset(mapper.ppu_map_read(0x1000)), 9 * 0x0400);

        mapper.cpu_map_write(0x8000, 0x80);
        assert_eq!(offset(mapper.ppu_map_read(0x0000)), 9 * 0x0400);
        assert_eq!(offset(mapper.ppu_map_read(0x1400)), 5 * 0x0400);
    }

    #[test]
    fn mapper4_scanline_irq_counts_down_from_latch() {
        let mut mapper = create_mapper(4, 2, 8).unwrap();
        mapper.cpu_map_write(0xC000, 2);
        mapper.cpu_map_write(0xC001, 0);
        mapper.cpu_map_write(0xE001, 0);

        mapper.on_scanline();
        assert!(!mapper.irq_state());
        mapper.on_scanline();
        assert!(!mapper.irq_state());
        mapper.on_scanline();
        assert!(mapper.irq_state());

        mapper.irq_clear();
        assert!(!mapper.irq_state());

        mapper.cpu_map_write(0xE000, 0);
        for _ in 0..6 {
            mapper.on_scanline();
        }
        assert!(!mapper.irq_state());
    }

    #[test]
    fn mapper66_switches_prg_and_chr() {
        let mut mapper = create_mapper(66, 4, 4).unwrap();
        mapper.cpu_map_write(0x8000, 0x11);
        assert_eq!(offset(mapper.cpu_map_read(0x8000)), 0x8000);
        assert_eq!(offset(mapper.ppu_map_read(0x0000)), 0x2000);
    }

    #[test]
    fn unknown_mapper_is_rejected() {
        let err = create_mapper(7, 2, 1).err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("unsupported mapper 7"));
    }
}
