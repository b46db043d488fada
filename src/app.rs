use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};
use tracing::{info, warn};

use crate::audio::AudioOutput;
use crate::config::{Pacing, Settings};
use crate::nes::ppu::{FRAME_HEIGHT, FRAME_WIDTH, PATTERN_TABLE_SIZE};
use crate::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, DEFAULT_SAMPLE_RATE, FRAME_RATE_HZ, Lifecycle, Nes,
};

const MAX_FRAMES_PER_UPDATE: u32 = 2;
const AUDIO_PACED_REPAINT: Duration = Duration::from_millis(4);

pub struct NesApp {
    nes: Arc<Mutex<Nes>>,
    settings: Settings,
    pacing: Pacing,
    audio: Option<AudioOutput>,

    frame_texture: Option<TextureHandle>,
    pattern_textures: [Option<TextureHandle>; 2],
    pattern_scratch: Vec<u8>,
    show_pattern_tables: bool,
    pattern_palette: u8,

    status_line: String,
    loaded_rom: Option<PathBuf>,
    frame_interval: Duration,
    next_frame_at: Option<Instant>,
}

impl NesApp {
    pub fn new(cc: &eframe::CreationContext<'_>, settings: Settings) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let nes = Arc::new(Mutex::new(Nes::new()));
        let audio = match AudioOutput::new(settings.pacing, &nes, settings.sample_rate) {
            Ok(audio) => Some(audio),
            Err(err) => {
                warn!(target: "audio", "audio unavailable: {err:#}");
                None
            }
        };

        // Without a device nothing would drive the core in audio pacing.
        let pacing = if audio.is_some() { settings.pacing } else { Pacing::Frame };
        if audio.is_none() {
            if let Ok(mut nes) = nes.lock() {
                nes.set_audio_sample_rate(settings.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE));
            }
        }

        Self {
            nes,
            settings,
            pacing,
            audio,
            frame_texture: None,
            pattern_textures: [None, None],
            pattern_scratch: vec![0; PATTERN_TABLE_SIZE * PATTERN_TABLE_SIZE * 4],
            show_pattern_tables: false,
            pattern_palette: 0,
            status_line: "Drop a .nes file or click Open ROM".to_string(),
            loaded_rom: None,
            frame_interval: Duration::from_secs_f64(1.0 / FRAME_RATE_HZ),
            next_frame_at: None,
        }
    }

    fn with_nes<R>(&self, f: impl FnOnce(&mut Nes) -> R) -> Option<R> {
        self.nes.lock().ok().map(|mut nes| f(&mut nes))
    }

    fn load_rom(&mut self, path: &Path) {
        self.save_battery();

        let result = self.with_nes(|nes| {
            nes.load_rom_from_path(path)?;
            let save = save_path(path);
            if let Ok(data) = fs::read(&save)
                && nes.load_battery_ram(&data)
            {
                info!(path = %save.display(), "battery RAM restored");
            }
            Ok::<_, anyhow::Error>(nes.mapper_name())
        });

        match result {
            Some(Ok(mapper)) => {
                self.loaded_rom = Some(path.to_path_buf());
                self.status_line = format!(
                    "Loaded {} using {}",
                    path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM"),
                    mapper
                );
                self.frame_texture = None;
                self.next_frame_at = None;
            }
            Some(Err(err)) => {
                warn!("failed to load ROM: {err:#}");
                self.status_line = format!("Failed to load ROM: {err:#}");
            }
            None => {
                self.status_line = "Emulator state unavailable".to_string();
            }
        }
    }

    fn save_battery(&self) {
        let Some(rom) = self.loaded_rom.as_ref() else {
            return;
        };
        let Some(Some(data)) = self.with_nes(|nes| nes.battery_ram().map(<[u8]>::to_vec)) else {
            return;
        };
        let path = save_path(rom);
        match fs::write(&path, data) {
            Ok(()) => info!(path = %path.display(), "battery RAM saved"),
            Err(err) => warn!(path = %path.display(), "failed to save battery RAM: {err}"),
        }
    }

    fn open_rom_dialog(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM")
            .pick_file()
        {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for file in dropped {
            if let Some(path) = file.path {
                let is_nes = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("nes"));

                if is_nes {
                    self.load_rom(&path);
                } else {
                    self.status_line = format!("Unsupported file: {}", path.display());
                }
            }
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        let open_shortcut = ctx.input(|i| i.modifiers.command && i.key_pressed(Key::O));
        if open_shortcut {
            self.open_rom_dialog();
        }

        if ctx.input(|i| i.key_pressed(Key::R)) {
            self.reset();
        }

        if ctx.input(|i| i.key_pressed(Key::P)) {
            self.toggle_pause();
        }
    }

    fn reset(&mut self) {
        let reset = self.with_nes(|nes| {
            if nes.has_rom() {
                nes.reset();
                nes.resume();
                true
            } else {
                false
            }
        });
        if reset == Some(true) {
            self.next_frame_at = None;
            self.status_line = "Reset complete".to_string();
        }
    }

    fn toggle_pause(&mut self) {
        self.with_nes(|nes| match nes.lifecycle() {
            Lifecycle::Running => nes.halt(),
            Lifecycle::Halted | Lifecycle::Stopped => nes.resume(),
        });
        self.next_frame_at = None;
    }

    fn controller_state_from_input(ctx: &egui::Context) -> u8 {
        let mut state = 0u8;

        ctx.input(|input| {
            let bindings = [
                (Key::ArrowUp, BUTTON_UP),
                (Key::W, BUTTON_UP),
                (Key::ArrowDown, BUTTON_DOWN),
                (Key::S, BUTTON_DOWN),
                (Key::ArrowLeft, BUTTON_LEFT),
                (Key::A, BUTTON_LEFT),
                (Key::ArrowRight, BUTTON_RIGHT),
                (Key::D, BUTTON_RIGHT),
                (Key::Z, BUTTON_A),
                (Key::Space, BUTTON_A),
                (Key::X, BUTTON_B),
                (Key::Enter, BUTTON_START),
            ];
            for (key, button) in bindings {
                if input.key_down(key) {
                    state |= button;
                }
            }
            if input.modifiers.shift {
                state |= BUTTON_SELECT;
            }
        });

        state
    }

    fn run_paced_frames(&mut self, now: Instant) {
        let mut next = self.next_frame_at.unwrap_or(now);
        let mut ran_frames = 0u32;
        let max_samples = self
            .audio
            .as_ref()
            .map(|audio| audio.sample_rate() as usize * 96 / 1000)
            .unwrap_or(usize::MAX);

        while Instant::now() >= next
            && self.queued_audio_samples() < max_samples
            && ran_frames < MAX_FRAMES_PER_UPDATE
        {
            let samples = self.with_nes(|nes| {
                nes.run_frame();
                nes.take_audio_samples()
            });
            if let (Some(audio), Some(samples)) = (&self.audio, samples) {
                audio.push_samples(&samples);
            }
            ran_frames += 1;
            next += self.frame_interval;
        }

        if ran_frames == 0 && now > next + self.frame_interval {
            next = now;
        }
        self.next_frame_at = Some(next);
    }

    fn queued_audio_samples(&self) -> usize {
        self.audio.as_ref().map_or(0, AudioOutput::queued_samples)
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        let Some(image) = self.with_nes(|nes| {
            ColorImage::from_rgba_unmultiplied([FRAME_WIDTH, FRAME_HEIGHT], nes.frame_buffer())
        }) else {
            return;
        };

        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, TextureOptions::NEAREST);
        } else {
            self.frame_texture = Some(ctx.load_texture("nes-frame", image, TextureOptions::NEAREST));
        }
    }

    fn update_pattern_textures(&mut self, ctx: &egui::Context) {
        for table in 0..2u8 {
            let mut scratch = std::mem::take(&mut self.pattern_scratch);
            let palette = self.pattern_palette;
            self.with_nes(|nes| nes.pattern_table(table, palette, &mut scratch));
            let image =
                ColorImage::from_rgba_unmultiplied([PATTERN_TABLE_SIZE, PATTERN_TABLE_SIZE], &scratch);
            self.pattern_scratch = scratch;

            let slot = &mut self.pattern_textures[table as usize];
            if let Some(texture) = slot.as_mut() {
                texture.set(image, TextureOptions::NEAREST);
            } else {
                *slot = Some(ctx.load_texture(
                    format!("pattern-table-{table}"),
                    image,
                    TextureOptions::NEAREST,
                ));
            }
        }
    }

    fn pattern_panel(&mut self, ctx: &egui::Context) {
        egui::SidePanel::right("pattern_tables").show(ctx, |ui| {
            ui.heading("Pattern tables");
            egui::ComboBox::from_label("Palette")
                .selected_text(palette_label(self.pattern_palette))
                .show_ui(ui, |ui| {
                    for palette in 0..8u8 {
                        ui.selectable_value(&mut self.pattern_palette, palette, palette_label(palette));
                    }
                });
            ui.separator();
            let size = egui::vec2(256.0, 256.0);
            for (table, texture) in self.pattern_textures.iter().enumerate() {
                ui.label(format!("${:04X}", table * 0x1000));
                if let Some(texture) = texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(size));
                }
            }
        });
    }
}

fn save_path(rom: &Path) -> PathBuf {
    rom.with_extension("sav")
}

fn palette_label(palette: u8) -> String {
    if palette < 4 {
        format!("Background {palette}")
    } else {
        format!("Sprite {}", palette - 4)
    }
}

impl eframe::App for NesApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);

        let state = Self::controller_state_from_input(ctx);
        let (has_rom, lifecycle) = self
            .with_nes(|nes| {
                nes.set_controller_state(0, state);
                (nes.has_rom(), nes.lifecycle())
            })
            .unwrap_or((false, Lifecycle::Stopped));

        let now = Instant::now();
        if self.pacing == Pacing::Frame && lifecycle == Lifecycle::Running {
            self.run_paced_frames(now);
        }

        self.update_texture(ctx);
        if self.show_pattern_tables {
            self.update_pattern_textures(ctx);
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Open ROM").clicked() {
                    self.open_rom_dialog();
                }

                if ui.add_enabled(has_rom, egui::Button::new("Reset (R)")).clicked() {
                    self.reset();
                }

                let pause_label = if lifecycle == Lifecycle::Running {
                    "Pause (P)"
                } else {
                    "Resume (P)"
                };
                if ui.add_enabled(has_rom, egui::Button::new(pause_label)).clicked() {
                    self.toggle_pause();
                }

                ui.checkbox(&mut self.show_pattern_tables, "Pattern tables");

                if let Some(path) = &self.loaded_rom {
                    ui.separator();
                    ui.label(path.display().to_string());
                }
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            let mapper = self.with_nes(|nes| nes.mapper_name()).unwrap_or_default();
            ui.horizontal_wrapped(|ui| {
                ui.label(&self.status_line);
                ui.separator();
                ui.label(format!("Mapper: {mapper}"));
                ui.separator();
                ui.label(format!("{lifecycle:?}"));
                ui.separator();
                match &self.audio {
                    Some(audio) => ui.label(format!(
                        "Audio: {} Hz, {:?} pacing",
                        audio.sample_rate(),
                        self.pacing
                    )),
                    None => ui.label("Audio: unavailable"),
                };
                ui.separator();
                ui.label("Controls: arrows/WASD, Z/Space=A, X=B, Enter=Start, Shift=Select, P=Pause, R=Reset");
            });
        });

        if self.show_pattern_tables {
            self.pattern_panel(ctx);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                let available = ui.available_size();
                let scale_x = (available.x / FRAME_WIDTH as f32).max(1.0);
                let scale_y = (available.y / FRAME_HEIGHT as f32).max(1.0);
                let scale = scale_x.min(scale_y).floor().max(1.0);
                let target = egui::vec2(FRAME_WIDTH as f32 * scale, FRAME_HEIGHT as f32 * scale);

                if let Some(texture) = &self.frame_texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(target));
                }
            });
        });

        match (self.pacing, self.next_frame_at) {
            (Pacing::Frame, Some(next)) => {
                let wait = next.saturating_duration_since(Instant::now());
                ctx.request_repaint_after(wait.min(self.frame_interval));
            }
            (Pacing::Frame, None) => ctx.request_repaint_after(self.frame_interval),
            (Pacing::Audio, _) => ctx.request_repaint_after(AUDIO_PACED_REPAINT),
        }
    }
}

impl Drop for NesApp {
    fn drop(&mut self) {
        self.save_battery();
        if let Err(err) = self.settings.save(Path::new(crate::config::SETTINGS_FILE)) {
            warn!("{err:#}");
        }
    }
}
