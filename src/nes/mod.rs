pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod mapper;
mod palette;
pub mod ppu;

use anyhow::Result;
use std::path::Path;
use tracing::{info, trace};

use bus::SystemBus;
use cartridge::Cartridge;
use cpu::{Cpu, CpuBus, CpuRegisters};
use mapper::mapper_name;

pub use cpu::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};
pub use palette::NES_PALETTE;

/// Controller bits, shifted out MSB first.
pub const BUTTON_A: u8 = 0x80;
pub const BUTTON_B: u8 = 0x40;
pub const BUTTON_SELECT: u8 = 0x20;
pub const BUTTON_START: u8 = 0x10;
pub const BUTTON_UP: u8 = 0x08;
pub const BUTTON_DOWN: u8 = 0x04;
pub const BUTTON_LEFT: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x01;

/// Master clock (PPU dot rate) in Hz.
pub const MASTER_CLOCK_HZ: f64 = 5_369_318.0;
pub const FRAME_RATE_HZ: f64 = 60.0988;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
    Halted,
}

pub struct Nes {
    cpu: Cpu,
    bus: SystemBus,
    lifecycle: Lifecycle,

    clock_counter: u64,
    audio_time: f64,
    time_per_sample: f64,
    audio_sample: f32,
    audio_samples: Vec<f32>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: SystemBus::new(),
            lifecycle: Lifecycle::Stopped,
            clock_counter: 0,
            audio_time: 0.0,
            time_per_sample: 1.0 / DEFAULT_SAMPLE_RATE as f64,
            audio_sample: 0.0,
            audio_samples: Vec::with_capacity(2048),
        }
    }

    pub fn has_rom(&self) -> bool {
        self.bus.cart.is_some()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn mapper_name(&self) -> String {
        match self.bus.cart.as_ref() {
            Some(cart) => format!("{} (mapper {})", mapper_name(cart.mapper_id()), cart.mapper_id()),
            None => "No ROM loaded".to_string(),
        }
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.bus.cart.as_ref()
    }

    pub fn ppu(&self) -> &ppu::Ppu {
        &self.bus.ppu
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.install_cartridge(cart);
        Ok(())
    }

    /// Parses and installs `bytes`. On error the current session is left
    /// untouched.
    pub fn load_rom_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let cart = Cartridge::from_bytes(bytes)?;
        self.install_cartridge(cart);
        Ok(())
    }

    fn install_cartridge(&mut self, cart: Cartridge) {
        self.bus.cart = Some(cart);
        self.reset();
        self.lifecycle = Lifecycle::Running;
        info!(mapper = %self.mapper_name(), "ROM loaded");
    }

    pub fn reset(&mut self) {
        if let Some(cart) = self.bus.cart.as_mut() {
            cart.reset();
        }
        self.bus.reset();
        self.bus.ppu.reset();
        self.bus.apu.reset();
        self.cpu.reset(&mut self.bus);
        self.clock_counter = 0;
        self.audio_time = 0.0;
        self.audio_sample = 0.0;
        self.audio_samples.clear();
        info!(pc = format_args!("${:04X}", self.cpu.pc), "system reset");
    }

    pub fn stop(&mut self) {
        self.set_lifecycle(Lifecycle::Stopped);
    }

    pub fn halt(&mut self) {
        self.set_lifecycle(Lifecycle::Halted);
    }

    /// Back to `Running`. Needs a cartridge.
    pub fn resume(&mut self) {
        if self.has_rom() {
            self.set_lifecycle(Lifecycle::Running);
        }
    }

    fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if self.lifecycle != lifecycle {
            info!(from = ?self.lifecycle, to = ?lifecycle, "lifecycle change");
            self.lifecycle = lifecycle;
        }
    }

    /// One master-clock tick. Returns true when a new audio sample was latched.
    pub fn step(&mut self) -> bool {
        if self.lifecycle != Lifecycle::Running {
            return false;
        }
        let Some(cart) = self.bus.cart.as_mut() else {
            return false;
        };

        self.bus.ppu.tick(cart);
        self.bus.apu.clock();

        if self.clock_counter % 3 == 0 {
            if self.bus.dma.transfer {
                self.bus.dma_cycle(self.clock_counter % 2 == 1);
            } else {
                self.cpu.clock(&mut self.bus);
            }
        }

        if self.bus.ppu.take_nmi() {
            trace!(target: "cpu", pc = format_args!("${:04X}", self.cpu.pc), "NMI");
            self.cpu.nmi(&mut self.bus);
        }

        let irq = self.bus.cart.as_mut().is_some_and(|cart| {
            let raised = cart.irq_state();
            if raised {
                cart.irq_clear();
            }
            raised
        });
        if irq {
            trace!(target: "cpu", pc = format_args!("${:04X}", self.cpu.pc), "IRQ");
            self.cpu.irq(&mut self.bus);
        }

        let mut sample_ready = false;
        self.audio_time += 1.0 / MASTER_CLOCK_HZ;
        if self.audio_time >= self.time_per_sample {
            self.audio_time -= self.time_per_sample;
            self.audio_sample = self.bus.apu.sample();
            sample_ready = true;
        }

        self.clock_counter += 1;
        sample_ready
    }

    /// Runs until the PPU finishes a frame, collecting audio samples.
    pub fn run_frame(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        self.bus.ppu.clear_frame_complete();
        while !self.bus.ppu.frame_complete() {
            if self.step() {
                self.audio_samples.push(self.audio_sample);
            }
        }
    }

    /// Steps until the next audio sample and returns it.
    pub fn run_until_sample(&mut self) -> f32 {
        if self.lifecycle == Lifecycle::Running {
            while !self.step() {}
        }
        self.audio_sample
    }

    /// Steps until the CPU finishes its next instruction.
    pub fn step_instruction(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let start = self.cpu.total_cycles();
        loop {
            self.step();
            if self.cpu.total_cycles() != start && self.cpu.is_instruction_complete() {
                break;
            }
        }
    }

    pub fn take_audio_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.audio_samples)
    }

    pub fn audio_sample(&self) -> f32 {
        self.audio_sample
    }

    pub fn set_audio_sample_rate(&mut self, sample_rate: u32) {
        self.time_per_sample = 1.0 / sample_rate.max(1) as f64;
    }

    pub fn set_controller_state(&mut self, player: usize, state: u8) {
        self.bus.set_controller_state(player, state);
    }

    /// 256x240 RGBA8.
    pub fn frame_buffer(&self) -> &[u8] {
        self.bus.ppu.frame_buffer()
    }

    pub fn frame_indices(&self) -> &[u8] {
        self.bus.ppu.frame_indices()
    }

    pub fn frame_complete(&self) -> bool {
        self.bus.ppu.frame_complete()
    }

    pub fn clear_frame_complete(&mut self) {
        self.bus.ppu.clear_frame_complete();
    }

    /// 128x128 RGBA8 view of a pattern table. Leaves `out` alone without a ROM.
    pub fn pattern_table(&self, table: u8, palette: u8, out: &mut [u8]) {
        if let Some(cart) = self.bus.cart.as_ref() {
            self.bus.ppu.pattern_table(table, palette, cart, out);
        }
    }

    pub fn battery_ram(&self) -> Option<&[u8]> {
        self.bus.cart.as_ref().and_then(|cart| cart.battery_ram())
    }

    pub fn load_battery_ram(&mut self, data: &[u8]) -> bool {
        self.bus
            .cart
            .as_mut()
            .is_some_and(|cart| cart.load_battery_ram(data))
    }

    pub fn cpu_registers(&self) -> CpuRegisters {
        self.cpu.registers()
    }

    pub fn clock_counter(&self) -> u64 {
        self.clock_counter
    }

    pub fn debug_peek(&self, addr: u16) -> u8 {
        self.bus.peek(addr)
    }

    pub fn disassemble(&self, addr: u16) -> (String, u16) {
        cpu::disassemble(&self.bus, addr)
    }

    pub fn debug_mapper_state(&self) -> String {
        match self.bus.cart.as_ref() {
            Some(cart) => cart.debug_state(),
            None => "No ROM loaded".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::tests::build_rom;
    use crate::nes::ppu::{DOTS_PER_SCANLINE, SCANLINES_PER_FRAME};

    const PRG_START: usize = 16;

    /// NROM image with `program` at $8000, reset at $8000 and NMI at $8100.
    fn program_rom(program: &[u8], nmi_handler: &[u8]) -> Vec<u8> {
        let mut rom = build_rom(0, 1, 1, 0);
        let prg = &mut rom[PRG_START..PRG_START + 0x4000];
        prg.fill(0xEA);
        prg[..program.len()].copy_from_slice(program);
        prg[0x100..0x100 + nmi_handler.len()].copy_from_slice(nmi_handler);
        prg[0x3FFA..0x3FFE].copy_from_slice(&[0x00, 0x81, 0x00, 0x80]);
        prg[0x3FFE..].copy_from_slice(&[0x00, 0x80]);
        rom
    }

    fn idle_rom() -> Vec<u8> {
        // JMP $8000
        program_rom(&[0x4C, 0x00, 0x80], &[0x40])
    }

    #[test]
    fn starts_stopped_until_a_rom_loads() {
        let mut nes = Nes::new();
        assert_eq!(nes.lifecycle(), Lifecycle::Stopped);
        assert!(!nes.step());
        nes.resume();
        assert_eq!(nes.lifecycle(), Lifecycle::Stopped);

        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        assert_eq!(nes.lifecycle(), Lifecycle::Running);
        assert_eq!(nes.cpu_registers().pc, 0x8000);
        assert_eq!(nes.cpu_registers().status, FLAG_UNUSED);
    }

    #[test]
    fn halted_system_does_not_advance() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        nes.halt();
        assert!(!nes.step());
        nes.run_frame();
        assert_eq!(nes.clock_counter(), 0);

        nes.resume();
        nes.step();
        assert_eq!(nes.clock_counter(), 1);
    }

    #[test]
    fn failed_load_keeps_running_session() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        for _ in 0..1000 {
            nes.step();
        }
        let before = (nes.clock_counter(), nes.cpu_registers());

        let err = nes.load_rom_from_bytes(&build_rom(9, 1, 1, 0));
        assert!(err.is_err());
        assert_eq!((nes.clock_counter(), nes.cpu_registers()), before);
        assert_eq!(nes.lifecycle(), Lifecycle::Running);
        assert_eq!(nes.cartridge().map(|cart| cart.mapper_id()), Some(0));
    }

    #[test]
    fn frames_are_341_by_262_master_ticks() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        nes.run_frame();
        let first = nes.clock_counter();
        nes.run_frame();
        assert_eq!(
            nes.clock_counter() - first,
            (DOTS_PER_SCANLINE * SCANLINES_PER_FRAME) as u64
        );
    }

    #[test]
    fn cpu_runs_every_third_tick() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        for _ in 0..300 {
            nes.step();
        }
        assert_eq!(nes.cpu.total_cycles(), 100);
    }

    #[test]
    fn nmi_is_delivered_when_enabled() {
        // LDA #$80; STA $2000; loop: JMP loop
        let program = [0xA9, 0x80, 0x8D, 0x00, 0x20, 0x4C, 0x05, 0x80];
        // NMI: INC $10; RTI
        let handler = [0xE6, 0x10, 0x40];
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&program, &handler)).unwrap();

        nes.run_frame();
        nes.run_frame();
        nes.run_frame();
        assert!(nes.debug_peek(0x0010) >= 2);
    }

    #[test]
    fn no_nmi_without_ctrl_bit() {
        let handler = [0xE6, 0x10, 0x40];
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&[0x4C, 0x00, 0x80], &handler)).unwrap();
        nes.run_frame();
        nes.run_frame();
        assert_eq!(nes.debug_peek(0x0010), 0);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls_cpu() {
        // LDX #$00; fill: TXA; STA $0200,X; INX; BNE fill; LDA #$02; STA $4014; loop
        let program = [
            0xA2, 0x00, 0x8A, 0x9D, 0x00, 0x02, 0xE8, 0xD0, 0xF9, 0xA9, 0x02, 0x8D, 0x14, 0x40,
            0x4C, 0x0E, 0x80,
        ];
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&program, &[0x40])).unwrap();

        while !nes.bus.dma.transfer {
            nes.step();
        }
        let cpu_cycles = nes.cpu.total_cycles();
        while nes.bus.dma.transfer {
            nes.step();
        }
        assert_eq!(nes.cpu.total_cycles(), cpu_cycles);
        assert_eq!(nes.ppu().debug_peek_oam(0x00), 0x00);
        assert_eq!(nes.ppu().debug_peek_oam(0x7F), 0x7F);
        assert_eq!(nes.ppu().debug_peek_oam(0xFF), 0xFF);
    }

    #[test]
    fn controller_state_reaches_the_cpu() {
        // LDA #$01; STA $4016; LDA #$00; STA $4016; LDA $4016; STA $20; LDA $4016; STA $21; loop
        let program = [
            0xA9, 0x01, 0x8D, 0x16, 0x40, 0xA9, 0x00, 0x8D, 0x16, 0x40, 0xAD, 0x16, 0x40, 0x85,
            0x20, 0xAD, 0x16, 0x40, 0x85, 0x21, 0x4C, 0x14, 0x80,
        ];
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&program, &[0x40])).unwrap();
        nes.set_controller_state(0, BUTTON_B);
        // Reset sequence plus eight instructions.
        for _ in 0..9 {
            nes.step_instruction();
        }
        assert_eq!(nes.debug_peek(0x20), 0);
        assert_eq!(nes.debug_peek(0x21), 1);
    }

    #[test]
    fn step_instruction_advances_one_opcode() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&[0xA9, 0x42, 0xAA, 0x4C, 0x03, 0x80], &[0x40]))
            .unwrap();
        // Burn the reset sequence.
        nes.step_instruction();
        assert_eq!(nes.cpu_registers().pc, 0x8000);

        nes.step_instruction();
        assert_eq!(nes.cpu_registers().a, 0x42);
        assert_eq!(nes.cpu_registers().pc, 0x8002);
        nes.step_instruction();
        assert_eq!(nes.cpu_registers().x, 0x42);
    }

    #[test]
    fn sample_rate_sets_samples_per_frame() {
        let mut nes = Nes::new();
        nes.set_audio_sample_rate(48_000);
        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        nes.run_frame();
        nes.take_audio_samples();
        nes.run_frame();
        let samples = nes.take_audio_samples().len();
        let expected = 89_342.0 * 48_000.0 / MASTER_CLOCK_HZ;
        assert!((samples as f64 - expected).abs() <= 1.0);
        assert!(nes.take_audio_samples().is_empty());
    }

    #[test]
    fn same_inputs_give_same_output() {
        let run = || {
            let mut nes = Nes::new();
            nes.load_rom_from_bytes(&idle_rom()).unwrap();
            nes.set_controller_state(0, BUTTON_START);
            let mut audio = Vec::new();
            for _ in 0..3 {
                nes.run_frame();
                audio.extend(nes.take_audio_samples());
            }
            (nes.frame_indices().to_vec(), audio, nes.cpu_registers())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn reset_restores_power_on_state() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&program_rom(&[0xA9, 0x42, 0x85, 0x00, 0x4C, 0x04, 0x80], &[0x40]))
            .unwrap();
        nes.run_frame();
        assert_eq!(nes.debug_peek(0x0000), 0x42);

        nes.reset();
        assert_eq!(nes.clock_counter(), 0);
        assert_eq!(nes.debug_peek(0x0000), 0x00);
        let regs = nes.cpu_registers();
        assert_eq!((regs.a, regs.x, regs.y, regs.sp, regs.pc), (0, 0, 0, 0xFD, 0x8000));
    }

    #[test]
    fn battery_ram_requires_battery_flag() {
        let mut nes = Nes::new();
        nes.load_rom_from_bytes(&build_rom(1, 2, 1, 0x02)).unwrap();
        assert_eq!(nes.battery_ram().map(<[u8]>::len), Some(0x8000));
        assert!(nes.load_battery_ram(&[0x11; 16]));
        assert_eq!(nes.battery_ram().map(|ram| ram[15]), Some(0x11));

        nes.load_rom_from_bytes(&idle_rom()).unwrap();
        assert!(nes.battery_ram().is_none());
    }
}
