use std::path::Path;

use scanline8::app;
use scanline8::config::{SETTINGS_FILE, Settings};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let settings = Settings::load(Path::new(SETTINGS_FILE));
    let filter_source = settings
        .as_ref()
        .map(|settings| settings.log_filter.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_source)),
        )
        .init();

    let settings = settings.unwrap_or_else(|err| {
        tracing::warn!("{err:#}; using default settings");
        Settings::default()
    });

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size(settings.window_size())
            .with_min_inner_size([512.0, 480.0])
            .with_title("Scanline-8")
            .with_drag_and_drop(true),
        vsync: true,
        ..Default::default()
    };

    eframe::run_native(
        "Scanline-8",
        options,
        Box::new(move |cc| Ok(Box::new(app::NesApp::new(cc, settings)))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run app: {err}"))
}
