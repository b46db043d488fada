use std::io::Write;
use std::path::Path;

use anyhow::Result;
use scanline8::nes::{FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW, FLAG_ZERO, Nes};
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("Commands:");
    println!("  step, s [n]        - Step n instructions (default 1)");
    println!("  frame, f [n]       - Run n frames (default 1)");
    println!("  run <n>            - Run n frames, then show registers");
    println!("  regs               - Show CPU registers");
    println!("  mem <addr> [len]   - Show memory bytes (hex)");
    println!("  disasm, d [addr] [n] - Disassemble n instructions (default PC, 8)");
    println!("  ppu                - Show PPU state");
    println!("  mapper             - Show mapper state");
    println!("  reset              - Reset the system");
    println!("  quit, q            - Exit debugger");
}

fn parse_addr(text: &str) -> Option<u16> {
    let digits = text.trim_start_matches('$').trim_start_matches("0x");
    u16::from_str_radix(digits, 16).ok()
}

fn parse_count(text: Option<&&str>, default: u32) -> u32 {
    text.and_then(|v| v.parse::<u32>().ok()).unwrap_or(default)
}

fn print_regs(nes: &Nes) {
    let regs = nes.cpu_registers();
    let p = regs.status;
    println!("A: ${:02X}  X: ${:02X}  Y: ${:02X}", regs.a, regs.x, regs.y);
    println!("P: {:08b} (NVUBDIZC)", p);
    println!("SP: ${:02X}  PC: ${:04X}", regs.sp, regs.pc);
    println!(
        "Flags: N={} V={} D={} I={} Z={} C={}",
        (p & FLAG_NEGATIVE) != 0,
        (p & FLAG_OVERFLOW) != 0,
        (p & FLAG_DECIMAL) != 0,
        (p & FLAG_INTERRUPT) != 0,
        (p & FLAG_ZERO) != 0,
        (p & FLAG_CARRY) != 0
    );
    println!("Master ticks: {}", nes.clock_counter());
}

fn print_disassembly(nes: &Nes, start: u16, count: u32) {
    let mut addr = start;
    for _ in 0..count {
        let (text, len) = nes.disassemble(addr);
        println!("{addr:04X}  {text}");
        addr = addr.wrapping_add(len);
    }
}

fn print_memory(nes: &Nes, start: u16, len: u16) {
    for row in (0..len).step_by(16) {
        let base = start.wrapping_add(row);
        let bytes: Vec<String> = (0..16u16.min(len - row))
            .map(|i| format!("{:02X}", nes.debug_peek(base.wrapping_add(i))))
            .collect();
        println!("{base:04X}: {}", bytes.join(" "));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("Scanline-8 Debugger");
    println!("===================");
    println!();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("Usage: scanline8_debug <rom.nes>");
        println!();
        print_help();
        return Ok(());
    }

    let rom_path = &args[1];
    println!("Loading ROM: {}", rom_path);

    let mut nes = Nes::new();
    nes.load_rom_from_path(Path::new(rom_path))?;

    println!("Mapper: {}", nes.mapper_name());
    println!();
    print_regs(&nes);
    println!();
    println!("Type 'help' for commands");

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some(command) = parts.first() else {
            continue;
        };

        match *command {
            "help" | "h" => print_help(),
            "step" | "s" => {
                for _ in 0..parse_count(parts.get(1), 1) {
                    nes.step_instruction();
                }
                let pc = nes.cpu_registers().pc;
                print_disassembly(&nes, pc, 1);
            }
            "frame" | "f" => {
                for _ in 0..parse_count(parts.get(1), 1) {
                    nes.run_frame();
                    nes.take_audio_samples();
                }
                let (scanline, cycle) = nes.ppu().debug_scanline_cycle();
                println!("At scanline {scanline}, dot {cycle}");
            }
            "run" => match parts.get(1).and_then(|v| v.parse::<u32>().ok()) {
                Some(frames) => {
                    for _ in 0..frames {
                        nes.run_frame();
                        nes.take_audio_samples();
                    }
                    print_regs(&nes);
                }
                None => println!("Usage: run <frames>"),
            },
            "regs" | "r" => print_regs(&nes),
            "mem" | "m" => match parts.get(1).and_then(|v| parse_addr(v)) {
                Some(addr) => {
                    let len = parts
                        .get(2)
                        .and_then(|v| v.parse::<u16>().ok())
                        .unwrap_or(16)
                        .max(1);
                    print_memory(&nes, addr, len);
                }
                None => println!("Usage: mem <addr> [len]"),
            },
            "disasm" | "d" => {
                let start = parts
                    .get(1)
                    .and_then(|v| parse_addr(v))
                    .unwrap_or(nes.cpu_registers().pc);
                print_disassembly(&nes, start, parse_count(parts.get(2), 8));
            }
            "ppu" => {
                let ppu = nes.ppu();
                let (scanline, cycle) = ppu.debug_scanline_cycle();
                println!("PPU State:");
                println!("  Scanline: {}, Dot: {}", scanline, cycle);
                println!("  $2000 (ctrl):   {:08b}", ppu.debug_ctrl().0);
                println!("  $2001 (mask):   {:08b}", ppu.debug_mask().0);
                println!("  $2002 (status): {:08b}", ppu.debug_status().0);
                println!("  v: ${:04X}", ppu.debug_vram_addr());
                println!("  frames: {}", ppu.frame_count());
            }
            "mapper" => println!("{}", nes.debug_mapper_state()),
            "reset" => {
                nes.reset();
                print_regs(&nes);
            }
            "quit" | "q" => {
                println!("Goodbye!");
                break;
            }
            other => {
                println!("Unknown command: {other}. Type 'help' for available commands.");
            }
        }
    }

    Ok(())
}
