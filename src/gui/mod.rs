/// egui front end for the control panel

mod timelapse_gui;

pub use timelapse_gui::{run, TimelapseGui};
