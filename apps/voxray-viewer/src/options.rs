//! Command line options.

use std::path::PathBuf;

use voxray_app::AppConfig;

/// Default grid edge length in voxels.
pub const DEFAULT_GRID: u32 = 16;

/// Options parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerOptions {
    pub vsync: bool,
    pub grid: u32,
    pub shader_dir: Option<PathBuf>,
    pub frames_in_flight: Option<usize>,
    pub target_fps: Option<u32>,
    pub help: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            vsync: false,
            grid: DEFAULT_GRID,
            shader_dir: None,
            frames_in_flight: None,
            target_fps: None,
            help: false,
        }
    }
}

fn value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
    let raw = value.ok_or_else(|| format!("{flag} needs a value"))?;
    raw.parse()
        .map_err(|_| format!("Invalid value for {flag}: {raw}"))
}

impl ViewerOptions {
    /// Parse options from the process arguments.
    pub fn from_args() -> Result<Self, String> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse options from arguments (without the program name).
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vsync" => options.vsync = true,
                "--grid" => options.grid = value("--grid", args.next())?,
                "--shaders" => options.shader_dir = Some(value("--shaders", args.next())?),
                "--frames-in-flight" => {
                    options.frames_in_flight = Some(value("--frames-in-flight", args.next())?);
                }
                "--fps" => options.target_fps = Some(value("--fps", args.next())?),
                "-h" | "--help" => options.help = true,
                other => return Err(format!("Unknown option: {other}")),
            }
        }

        if options.grid == 0 {
            return Err("--grid must be at least 1".to_string());
        }
        Ok(options)
    }

    /// Application config for these options.
    pub fn app_config(&self) -> AppConfig {
        let mut config = AppConfig::new("Voxray Viewer").with_vsync(self.vsync);
        if let Some(dir) = &self.shader_dir {
            config = config.with_shader_dir(dir.clone());
        }
        if let Some(count) = self.frames_in_flight {
            config = config.with_frames_in_flight(count);
        }
        if let Some(fps) = self.target_fps {
            config = config.with_target_fps(fps);
        }
        config
    }
}

pub fn print_help() {
    eprintln!(
        "Voxray Viewer: ray traced voxel grid

USAGE:
    cargo run -p voxray-viewer -- [OPTIONS]

OPTIONS:
    --vsync                   Prefer FIFO presentation
    --grid <N>                Grid edge length in voxels (default: {DEFAULT_GRID})
    --shaders <DIR>           Directory with raygen/miss/closest_hit/intersection .spv
                              (default: shaders)
    --frames-in-flight <N>    Limit CPU/GPU overlap to N frames
    --fps <N>                 Target frame rate
    -h, --help                Print this help message

CONTROLS:
    Space                     Pause or resume the orbit

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log level (e.g., info, debug, trace)"
    );
}
