//! Voxray Demo Viewer
//!
//! Ray traces a grid of voxel cubes with hardware ray tracing while an orbit
//! camera circles it. Voxels appear row by row, so the TLAS is rebuilt as the
//! scene grows.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p voxray-viewer -- [OPTIONS]
//! ```
//!
//! Run with `--help` for the option list. Compiled shaders are read from
//! `shaders/` unless `--shaders` says otherwise.

mod app;
mod options;

use voxray_app::run_app;

use crate::app::Viewer;
use crate::options::{print_help, ViewerOptions};

fn main() -> anyhow::Result<()> {
    let options = match ViewerOptions::from_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}\n");
            print_help();
            std::process::exit(2);
        }
    };
    if options.help {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(options.app_config())
}
