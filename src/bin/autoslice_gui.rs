/// Timelapse control panel window
///
/// Run with: cargo run --bin autoslice_gui

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use autoslice::config_loader;
use autoslice::ControlPanel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log at debug level instead of info
    #[arg(long)]
    debug: bool,
    /// Path to autoslice.yaml (defaults to $AUTOSLICE_CONFIG, then the crate directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    autoslice::logger(args.debug, std::env::var("RUST_LOG").ok().as_deref()).init();

    let settings = config_loader::load_settings(args.config.as_deref())?;
    let panel = ControlPanel::new(settings);
    autoslice::gui::run(panel)
}
