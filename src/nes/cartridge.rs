use anyhow::{Context, Result, bail};
use std::{fs, path::Path};
use tracing::info;

use super::mapper::{MappedRead, MappedWrite, Mapper, Mirroring, create_mapper, mapper_name};

const HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;
const PRG_BANK_SIZE: usize = 16 * 1024;
const CHR_BANK_SIZE: usize = 8 * 1024;

/// Parsed iNES / NES 2.0 header fields the emulator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub mapper_id: u16,
    pub prg_banks: usize,
    pub chr_banks: usize,
    pub mirroring: Mirroring,
    pub has_battery: bool,
    pub has_trainer: bool,
    pub is_nes2: bool,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mut prg_banks = bytes[4] as usize;
        let mut chr_banks = bytes[5] as usize;
        if is_nes2 {
            let prg_msb = (bytes[9] & 0x0F) as usize;
            let chr_msb = (bytes[9] >> 4) as usize;
            if prg_msb == 0x0F || chr_msb == 0x0F {
                bail!("NES 2.0 exponent/multiplier ROM size encoding is not supported");
            }
            prg_banks |= prg_msb << 8;
            chr_banks |= chr_msb << 8;
        }
        if prg_banks == 0 {
            bail!("invalid PRG ROM: header declares zero banks");
        }

        Ok(Self {
            mapper_id: (flags7 & 0xF0) as u16 | (flags6 >> 4) as u16,
            prg_banks,
            chr_banks,
            mirroring: if (flags6 & 0x01) != 0 {
                Mirroring::Vertical
            } else {
                Mirroring::Horizontal
            },
            has_battery: (flags6 & 0x02) != 0,
            has_trainer: (flags6 & 0x04) != 0,
            is_nes2,
        })
    }
}

pub struct Cartridge {
    header: Header,
    prg_memory: Vec<u8>,
    chr_memory: Vec<u8>,
    mapper: Box<dyn Mapper>,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to load ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Header::parse(bytes)?;

        let mut cursor = HEADER_SIZE;
        if header.has_trainer {
            cursor += TRAINER_SIZE;
        }

        let prg_size = header.prg_banks * PRG_BANK_SIZE;
        let prg_end = cursor + prg_size;
        if bytes.len() < prg_end {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_size
            );
        }
        let prg_memory = bytes[cursor..prg_end].to_vec();
        cursor = prg_end;

        let chr_memory = if header.chr_banks == 0 {
            vec![0; CHR_BANK_SIZE]
        } else {
            let chr_size = header.chr_banks * CHR_BANK_SIZE;
            if bytes.len() < cursor + chr_size {
                bail!(
                    "ROM truncated: expected {} CHR bytes but file ended early",
                    chr_size
                );
            }
            bytes[cursor..cursor + chr_size].to_vec()
        };

        let mapper = create_mapper(header.mapper_id, header.prg_banks, header.chr_banks)?;

        info!(
            mapper = header.mapper_id,
            name = mapper_name(header.mapper_id),
            prg_banks = header.prg_banks,
            chr_banks = header.chr_banks,
            mirroring = ?header.mirroring,
            battery = header.has_battery,
            nes2 = header.is_nes2,
            "cartridge loaded"
        );

        Ok(Self {
            header,
            prg_memory,
            chr_memory,
            mapper,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn mapper_id(&self) -> u16 {
        self.header.mapper_id
    }

    pub fn has_battery(&self) -> bool {
        self.header.has_battery
    }

    /// Returns `None` when the cartridge does not claim `addr`.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        match self.mapper.cpu_map_read(addr) {
            MappedRead::Unmapped => None,
            MappedRead::Data(value) => Some(value),
            MappedRead::Offset(offset) => Some(self.prg_memory[offset % self.prg_memory.len()]),
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) -> bool {
        match self.mapper.cpu_map_write(addr, value) {
            MappedWrite::Unmapped => false,
            MappedWrite::Handled => true,
            MappedWrite::Offset(offset) => {
                let len = self.prg_memory.len();
                self.prg_memory[offset % len] = value;
                true
            }
        }
    }

    pub fn ppu_read(&self, addr: u16) -> Option<u8> {
        match self.mapper.ppu_map_read(addr) {
            MappedRead::Unmapped => None,
            MappedRead::Data(value) => Some(value),
            MappedRead::Offset(offset) => Some(self.chr_memory[offset % self.chr_memory.len()]),
        }
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) -> bool {
        match self.mapper.ppu_map_write(addr) {
            MappedWrite::Unmapped => false,
            MappedWrite::Handled => true,
            MappedWrite::Offset(offset) => {
                let len = self.chr_memory.len();
                self.chr_memory[offset % len] = value;
                true
            }
        }
    }

    /// Effective nametable mirroring: a mapper override wins over the header.
    pub fn mirroring(&self) -> Mirroring {
        match self.mapper.mirroring() {
            Mirroring::Hardware => self.header.mirroring,
            mode => mode,
        }
    }

    pub fn irq_state(&self) -> bool {
        self.mapper.irq_state()
    }

    pub fn irq_clear(&mut self) {
        self.mapper.irq_clear();
    }

    pub fn on_scanline(&mut self) {
        self.mapper.on_scanline();
    }

    pub fn reset(&mut self) {
        self.mapper.reset();
    }

    pub fn battery_ram(&self) -> Option<&[u8]> {
        if self.header.has_battery {
            self.mapper.battery_ram()
        } else {
            None
        }
    }

    /// Copies a saved image into battery RAM. Returns false when the
    /// cartridge has none. Extra or missing bytes are tolerated.
    pub fn load_battery_ram(&mut self, data: &[u8]) -> bool {
        if !self.header.has_battery {
            return false;
        }
        match self.mapper.battery_ram_mut() {
            Some(ram) => {
                let len = ram.len().min(data.len());
                ram[..len].copy_from_slice(&data[..len]);
                true
            }
            None => false,
        }
    }

    pub fn debug_state(&self) -> String {
        format!(
            "mapper {} ({}) {}",
            self.header.mapper_id,
            mapper_name(self.header.mapper_id),
            self.mapper.debug_state()
        )
    }
}
