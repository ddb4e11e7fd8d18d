/// Headless front end: list ports, send one command, or run a timelapse
///
/// Run with: cargo run --bin autoslice_cli -- run --port /dev/ttyACM0 --output ./frames

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use autoslice::config_loader;
use autoslice::timelapse::RunStatus;
use autoslice::{ControlPanel, Notice, NoticeLevel};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log at debug level instead of info
    #[arg(long, global = true)]
    debug: bool,
    /// Path to autoslice.yaml (defaults to $AUTOSLICE_CONFIG, then the crate directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Send one command line to the board and print the response
    Send {
        #[arg(long)]
        port: Option<String>,
        command: String,
    },
    /// Run a timelapse in the foreground; Ctrl-C stops it after the current frame
    Run {
        /// Board port; without it frames are captured but the stage is not advanced
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        duration: Option<u64>,
        #[arg(long)]
        shutter: Option<u64>,
        #[arg(long)]
        gain: Option<f64>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
    },
}

fn report(notice: &Notice) {
    match notice.level {
        NoticeLevel::Error => eprintln!("✗ {}: {}", notice.title, notice.message),
        NoticeLevel::Warning => eprintln!("⚠ {}: {}", notice.title, notice.message),
        NoticeLevel::Info => println!("✓ {}: {}", notice.title, notice.message),
    }
}

/// Print the notice and turn an error notice into a failing exit.
fn check(notice: Notice) -> Result<()> {
    report(&notice);
    if notice.is_error() {
        return Err(anyhow!("{}", notice.message));
    }
    Ok(())
}

fn resolve_port(panel: &ControlPanel, port: Option<String>) -> Result<String> {
    if let Some(p) = port {
        return Ok(p);
    }
    let (_, preferred) = panel.refresh_ports();
    preferred.ok_or_else(|| anyhow!("No ports available; pass --port"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    autoslice::logger(args.debug, std::env::var("RUST_LOG").ok().as_deref()).init();

    let settings = config_loader::load_settings(args.config.as_deref())?;
    let mut panel = ControlPanel::new(settings);

    match args.command {
        Cmd::Ports => {
            let (ports, preferred) = panel.refresh_ports();
            if ports.is_empty() {
                println!("{}", autoslice::serial_ports::NO_PORTS_PLACEHOLDER);
            }
            for entry in ports {
                let mark = if preferred.as_deref() == Some(entry.name.as_str()) { "*" } else { " " };
                println!("{} {}", mark, entry.label());
            }
            Ok(())
        }
        Cmd::Send { port, command } => {
            let port = resolve_port(&panel, port)?;
            check(panel.connect(&port))?;
            check(panel.send_command(&command))
        }
        Cmd::Run { port, output, interval, duration, shutter, gain, width, height } => {
            if let Some(port) = port {
                check(panel.connect(&port))?;
            } else {
                println!("⚠ No --port given: the stage will not be advanced");
            }

            let mut form = panel.session_form();
            if let Some(v) = output { form.output_dir = v.display().to_string(); }
            if let Some(v) = interval { form.interval = v.to_string(); }
            if let Some(v) = duration { form.duration = v.to_string(); }
            if let Some(v) = shutter { form.shutter = v.to_string(); }
            if let Some(v) = gain { form.gain = v.to_string(); }
            if let Some(v) = width { form.width = v.to_string(); }
            if let Some(v) = height { form.height = v.to_string(); }

            if let Some(notice) = panel.start_timelapse(&form) {
                return check(notice);
            }
            println!("Timelapse running ({}), Ctrl-C to stop", panel.run_status());

            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
            ctrlc::set_handler(move || {
                let _ = stop_tx.try_send(());
            })?;

            // Wait for either the run to finish or Ctrl-C.
            let status = loop {
                if stop_rx.recv_timeout(Duration::from_millis(200)).is_ok() {
                    println!("Stopping after the current frame...");
                    panel.cancel_timelapse();
                    break panel.wait_for_run().unwrap_or_default();
                }
                if !panel.is_running() {
                    break panel.wait_for_run().unwrap_or_default();
                }
            };

            let notice = Notice::for_outcome(&status);
            report(&notice);
            match status {
                RunStatus::Aborted { reason, .. } => Err(anyhow!("{}", reason)),
                _ => Ok(()),
            }
        }
    }
}
