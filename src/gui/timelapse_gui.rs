use anyhow::{anyhow, Result};
use eframe::egui;
use std::time::Duration;

use crate::control_panel::{ControlPanel, Notice, NoticeLevel, SessionForm};
use crate::serial_ports::{PortEntry, NO_PORTS_PLACEHOLDER};
use crate::timelapse::RunEvent;

const WINDOW_TITLE: &str = "Timelapse Photography with Arduino Motor Control";

/// Main window. All hardware access goes through `ControlPanel`; this type
/// only holds widget state.
pub struct TimelapseGui {
    panel: ControlPanel,
    form: SessionForm,
    ports: Vec<PortEntry>,
    selected_port: String,
    command: String,
    last_response: String,
    status_line: String,
    notice: Option<Notice>,
}

impl TimelapseGui {
    pub fn new(panel: ControlPanel) -> Self {
        let form = panel.session_form();
        let mut gui = Self {
            panel,
            form,
            ports: Vec::new(),
            selected_port: String::new(),
            command: String::new(),
            last_response: String::new(),
            status_line: "Idle".to_string(),
            notice: None,
        };
        gui.refresh_ports();
        gui
    }

    fn refresh_ports(&mut self) {
        let (ports, selected) = self.panel.refresh_ports();
        self.ports = ports;
        self.selected_port = selected.unwrap_or_else(|| NO_PORTS_PLACEHOLDER.to_string());
    }

    fn show(&mut self, notice: Option<Notice>) {
        if let Some(n) = notice {
            self.notice = Some(n);
        }
    }

    fn poll_run_events(&mut self) {
        for event in self.panel.poll_events() {
            match event {
                RunEvent::Started { iterations } => {
                    self.status_line = format!("Running: {} photos", iterations);
                }
                RunEvent::Finished(status) => {
                    self.status_line = format!("Last run {}", status);
                    self.notice = Some(Notice::for_outcome(&status));
                }
            }
        }
    }

    fn session_fields(&mut self, ui: &mut egui::Ui) {
        egui::Grid::new("session_fields")
            .num_columns(3)
            .spacing([8.0, 6.0])
            .show(ui, |ui| {
                ui.label("Output Folder:");
                ui.add(egui::TextEdit::singleline(&mut self.form.output_dir).desired_width(320.0));
                if ui.button("Browse").clicked() {
                    if let Some(dir) = rfd::FileDialog::new().pick_folder() {
                        self.form.output_dir = dir.display().to_string();
                    }
                }
                ui.end_row();

                let fields = [
                    ("Interval (seconds):", &mut self.form.interval),
                    ("Total Duration (seconds):", &mut self.form.duration),
                    ("Shutter (microseconds):", &mut self.form.shutter),
                    ("Gain:", &mut self.form.gain),
                    ("Width:", &mut self.form.width),
                    ("Height:", &mut self.form.height),
                ];
                for (label, value) in fields {
                    ui.label(label);
                    ui.text_edit_singleline(value);
                    ui.end_row();
                }
            });
    }

    fn camera_controls(&mut self, ui: &mut egui::Ui) {
        let running = self.panel.is_running();
        ui.horizontal(|ui| {
            if ui.add_enabled(!running, egui::Button::new("Open Camera Preview")).clicked() {
                let notice = self.panel.start_preview();
                self.show(notice);
            }
            if ui.button("Stop Camera Preview").clicked() {
                let notice = self.panel.stop_preview();
                self.show(notice);
            }
            if self.panel.preview_active() {
                ui.label("preview on");
            }
        });
        ui.horizontal(|ui| {
            if ui.add_enabled(!running, egui::Button::new("Start Timelapse")).clicked() {
                let notice = self.panel.start_timelapse(&self.form);
                self.show(notice);
            }
            if ui.add_enabled(running, egui::Button::new("Stop Timelapse")).clicked() {
                let notice = self.panel.cancel_timelapse();
                self.show(notice);
            }
            ui.label(self.status_line.as_str());
        });
    }

    fn serial_controls(&mut self, ui: &mut egui::Ui) {
        let running = self.panel.is_running();
        ui.horizontal(|ui| {
            ui.label("Select Arduino Port:");
            egui::ComboBox::from_id_source("port_select")
                .width(260.0)
                .selected_text(self.selected_port.clone())
                .show_ui(ui, |ui| {
                    for entry in &self.ports {
                        ui.selectable_value(&mut self.selected_port, entry.name.clone(), entry.label());
                    }
                });
            if ui.button("Refresh Ports").clicked() {
                self.refresh_ports();
            }
        });
        ui.horizontal(|ui| {
            if ui.add_enabled(!running, egui::Button::new("Connect to Arduino")).clicked() {
                let notice = self.panel.connect(&self.selected_port);
                self.notice = Some(notice);
            }
            if ui.add_enabled(!running, egui::Button::new("Disconnect Port")).clicked() {
                let notice = self.panel.disconnect();
                self.notice = Some(notice);
            }
            match self.panel.connected_port() {
                Some(port) => ui.label(format!("connected: {} @ {} baud", port, self.panel.settings().arduino.baud)),
                None => ui.label("not connected"),
            };
        });
        ui.horizontal(|ui| {
            ui.label("Send Command:");
            ui.add(egui::TextEdit::singleline(&mut self.command).desired_width(240.0));
            if ui.add_enabled(!running, egui::Button::new("Send")).clicked() {
                let notice = self.panel.send_command(&self.command);
                if notice.title == "Command Sent" {
                    self.last_response = notice.message.clone();
                }
                self.notice = Some(notice);
            }
        });
        if !self.last_response.is_empty() {
            ui.label(self.last_response.as_str());
        }
    }

    fn notice_window(&mut self, ctx: &egui::Context) {
        let Some(notice) = self.notice.as_ref() else {
            return;
        };
        let mut dismissed = false;
        egui::Window::new(notice.title.as_str())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                let color = match notice.level {
                    NoticeLevel::Error => ui.visuals().error_fg_color,
                    NoticeLevel::Warning => ui.visuals().warn_fg_color,
                    NoticeLevel::Info => ui.visuals().text_color(),
                };
                ui.colored_label(color, notice.message.as_str());
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.notice = None;
        }
    }
}

impl eframe::App for TimelapseGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_run_events();
        if self.panel.is_running() {
            // Keep polling for the Finished event while idle-rendering.
            ctx.request_repaint_after(Duration::from_millis(250));
        }

        let modal_open = self.notice.is_some();
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add_enabled_ui(!modal_open, |ui| {
                self.session_fields(ui);
                ui.separator();
                self.camera_controls(ui);
                ui.separator();
                self.serial_controls(ui);
            });
        });

        self.notice_window(ctx);
    }
}

/// Open the window and block until it is closed. Dropping the panel on exit
/// stops the preview, cancels a run and closes the port.
pub fn run(panel: ControlPanel) -> Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(WINDOW_TITLE)
            .with_inner_size([620.0, 560.0]),
        ..Default::default()
    };
    eframe::run_native(
        WINDOW_TITLE,
        options,
        Box::new(|_cc| Box::new(TimelapseGui::new(panel))),
    )
    .map_err(|e| anyhow!("GUI error: {}", e))
}
