use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use quick_xml::Reader;
use quick_xml::events::Event;
use scanline8::nes::Nes;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
    recordedinput: String,
}

/// Byte orders a suite may have hashed its reference screenshot in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Rgba,
    Rgb,
    Argb,
    Bgra,
}

impl PixelLayout {
    const ALL: [PixelLayout; 4] = [Self::Rgba, Self::Rgb, Self::Argb, Self::Bgra];

    fn label(self) -> &'static str {
        match self {
            Self::Rgba => "rgba",
            Self::Rgb => "rgb",
            Self::Argb => "argb",
            Self::Bgra => "bgra",
        }
    }

    fn reorder(self, px: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Rgba => out.extend_from_slice(px),
            Self::Rgb => out.extend_from_slice(&px[..3]),
            Self::Argb => out.extend_from_slice(&[px[3], px[0], px[1], px[2]]),
            Self::Bgra => out.extend_from_slice(&[px[2], px[1], px[0], px[3]]),
        }
    }
}

fn hash_frame(frame_rgba: &[u8], layout: PixelLayout) -> String {
    let mut bytes = Vec::with_capacity(frame_rgba.len());
    for px in frame_rgba.chunks_exact(4) {
        layout.reorder(px, &mut bytes);
    }
    BASE64_STANDARD.encode(Sha1::digest(&bytes))
}

#[derive(Debug, Clone)]
struct RunResult {
    hashes: Vec<(PixelLayout, String)>,
    frames: u32,
    pc: u16,
    ppu_ctrl: u8,
    ppu_mask: u8,
    ppu_status: u8,
    ppu_scanline: i16,
    ppu_cycle: i16,
    status_code: Option<u8>,
    status_text: String,
    mapper_state: String,
}

impl RunResult {
    fn matching_layout(&self, expected: &str) -> Option<PixelLayout> {
        self.hashes
            .iter()
            .find(|(_, hash)| hash == expected)
            .map(|(layout, _)| *layout)
    }
}

#[derive(Debug, Clone)]
struct Config {
    suite: PathBuf,
    rom_root: PathBuf,
    max_tests: usize,
    include_pal: bool,
    contains: Vec<String>,
    frame_multiplier: u32,
    extra_frames: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("external/nes-test-roms/test_roms.xml"),
            rom_root: PathBuf::from("external/nes-test-roms"),
            max_tests: 80,
            include_pal: false,
            contains: Vec::new(),
            frame_multiplier: 1,
            extra_frames: 0,
        }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--suite" => {
                let value = args.next().context(
                    "--suite requires a path, e.g. --suite external/nes-test-roms/test_roms.xml",
                )?;
                cfg.suite = PathBuf::from(value);
            }
            "--rom-root" => {
                let value = args.next().context(
                    "--rom-root requires a path, e.g. --rom-root external/nes-test-roms",
                )?;
                cfg.rom_root = PathBuf::from(value);
            }
            "--max-tests" => {
                let value = args
                    .next()
                    .context("--max-tests requires an integer, e.g. --max-tests 120")?;
                cfg.max_tests = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --max-tests value: {value}"))?;
            }
            "--include-pal" => cfg.include_pal = true,
            "--contains" => {
                let value = args
                    .next()
                    .context("--contains requires a substring, e.g. --contains instr_test")?;
                cfg.contains.push(value.to_lowercase());
            }
            "--frame-multiplier" => {
                let value = args
                    .next()
                    .context("--frame-multiplier requires an integer, e.g. --frame-multiplier 2")?;
                cfg.frame_multiplier = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frame-multiplier value: {value}"))?;
            }
            "--extra-frames" => {
                let value = args
                    .next()
                    .context("--extra-frames requires an integer, e.g. --extra-frames 120")?;
                cfg.extra_frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --extra-frames value: {value}"))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "ROM suite runner for Scanline-8\n\n\
Usage:\n\
  cargo run --bin rom_test_runner -- [options]\n\n\
Options:\n\
  --suite <path>                 Path to test_roms.xml\n\
  --rom-root <path>              Root path containing ROM files\n\
  --max-tests <n>                Maximum number of tests to run (default 80)\n\
  --include-pal                  Include PAL tests\n\
  --contains <substr>            Only run tests whose filename contains this text (repeatable)\n\
  --frame-multiplier <n>         Multiply XML runframes by n (default 1)\n\
  --extra-frames <n>             Add n frames after XML runframes (default 0)\n\
  -h, --help                     Show this help\n\n\
Tests that need recorded controller input are always skipped.\n\
Set RUST_LOG=debug for per-test detail."
    );
}

fn parse_suite_xml(path: &Path) -> Result<Vec<SuiteTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite XML: {}", path.display()))?;
    parse_suite(&xml)
}

fn parse_suite(xml: &str) -> Result<Vec<SuiteTest>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut reading_tvsha1 = false;
    let mut reading_recorded = false;

    loop {
        let text = match reader.read_event() {
            Ok(Event::Start(e)) => {
                match e.name().as_ref() {
                    b"test" => {
                        let mut test = SuiteTest {
                            filename: String::new(),
                            system: String::new(),
                            runframes: 0,
                            tvsha1: String::new(),
                            recordedinput: String::new(),
                        };
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .decode_and_unescape_value(reader.decoder())
                                .map(|v| v.to_string())
                                .unwrap_or_default();
                            match attr.key.as_ref() {
                                b"filename" => test.filename = value,
                                b"system" => test.system = value,
                                b"runframes" => test.runframes = value.parse::<u32>().unwrap_or(0),
                                _ => {}
                            }
                        }
                        current = Some(test);
                    }
                    b"tvsha1" => reading_tvsha1 = true,
                    b"recordedinput" => reading_recorded = true,
                    _ => {}
                }
                continue;
            }
            Ok(Event::Text(e)) => e.decode().map(|v| v.to_string()).unwrap_or_default(),
            Ok(Event::CData(e)) => e.decode().map(|v| v.to_string()).unwrap_or_default(),
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"tvsha1" => reading_tvsha1 = false,
                    b"recordedinput" => reading_recorded = false,
                    b"test" => {
                        if let Some(mut test) = current.take() {
                            test.tvsha1 = test.tvsha1.trim().to_string();
                            test.recordedinput = test.recordedinput.trim().to_string();
                            tests.push(test);
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!("failed to parse suite XML: {err}");
            }
            _ => continue,
        };

        if let Some(test) = current.as_mut() {
            if reading_tvsha1 {
                test.tvsha1.push_str(&text);
            } else if reading_recorded {
                test.recordedinput.push_str(&text);
            }
        }
    }

    Ok(tests)
}

fn should_run(test: &SuiteTest, cfg: &Config) -> bool {
    if !cfg.include_pal && test.system.eq_ignore_ascii_case("pal") {
        return false;
    }

    if !test.recordedinput.is_empty() {
        return false;
    }

    if !cfg.contains.is_empty() {
        let lower = test.filename.to_lowercase();
        if !cfg.contains.iter().any(|f| lower.contains(f)) {
            return false;
        }
    }

    true
}

/// Reads the status block many test ROMs leave in cartridge RAM: a code at
/// $6000, the signature DE B0 61 at $6001, then a NUL-terminated message.
fn read_status_block(nes: &Nes) -> (Option<u8>, String) {
    let signature = [nes.debug_peek(0x6001), nes.debug_peek(0x6002), nes.debug_peek(0x6003)];
    if signature != [0xDE, 0xB0, 0x61] {
        return (None, String::new());
    }

    let mut text = String::new();
    for addr in 0x6004u16..0x7000 {
        let byte = nes.debug_peek(addr);
        if byte == 0 {
            break;
        }
        text.push(byte as char);
    }
    (Some(nes.debug_peek(0x6000)), text.trim().to_string())
}

fn run_single(test: &SuiteTest, cfg: &Config) -> Result<RunResult> {
    let rom_path = cfg.rom_root.join(&test.filename);
    let mut nes = Nes::new();
    nes.load_rom_from_path(&rom_path)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;
    debug!(rom = %test.filename, mapper = %nes.mapper_name(), "running");

    let frames = test
        .runframes
        .saturating_mul(cfg.frame_multiplier)
        .saturating_add(cfg.extra_frames);
    for _ in 0..frames {
        nes.run_frame();
        nes.take_audio_samples();
    }

    let frame = nes.frame_buffer();
    let ppu = nes.ppu();
    let (ppu_scanline, ppu_cycle) = ppu.debug_scanline_cycle();
    let (status_code, status_text) = read_status_block(&nes);

    Ok(RunResult {
        hashes: PixelLayout::ALL
            .iter()
            .map(|&layout| (layout, hash_frame(frame, layout)))
            .collect(),
        frames,
        pc: nes.cpu_registers().pc,
        ppu_ctrl: ppu.debug_ctrl().0,
        ppu_mask: ppu.debug_mask().0,
        ppu_status: ppu.debug_status().0,
        ppu_scanline,
        ppu_cycle,
        status_code,
        status_text,
        mapper_state: nes.debug_mapper_state(),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cfg = parse_args()?;

    let start = Instant::now();
    let tests = parse_suite_xml(&cfg.suite)?;

    let selected: Vec<SuiteTest> = tests
        .into_iter()
        .filter(|t| should_run(t, &cfg))
        .take(cfg.max_tests)
        .collect();

    println!(
        "Running {} test(s) from {}",
        selected.len(),
        cfg.suite.display()
    );

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for (idx, test) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
        match run_single(test, &cfg) {
            Ok(result) => {
                if let Some(layout) = result.matching_layout(&test.tvsha1) {
                    passed += 1;
                    println!("PASS {label} [{}]", layout.label());
                } else if result.status_code == Some(0) {
                    passed += 1;
                    println!("PASS {label} [status-block]");
                } else {
                    failed += 1;
                    println!("FAIL {label}");
                    println!("  expected: {}", test.tvsha1);
                    for (layout, hash) in &result.hashes {
                        println!("  got {:<4}: {hash}", layout.label());
                    }
                    println!(
                        "  frames={} pc=${:04X} ppu ctrl=${:02X} mask=${:02X} status=${:02X} sl={} cy={}",
                        result.frames,
                        result.pc,
                        result.ppu_ctrl,
                        result.ppu_mask,
                        result.ppu_status,
                        result.ppu_scanline,
                        result.ppu_cycle
                    );
                    if let Some(code) = result.status_code {
                        println!("  status=${code:02X} {}", result.status_text);
                    }
                    println!("  {}", result.mapper_state);
                }
            }
            Err(err) => {
                skipped += 1;
                warn!("{err:#}");
                println!("SKIP {label} -> {err}");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", elapsed);

    Ok(())
}
