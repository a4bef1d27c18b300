use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "aixel")]
#[command(about = "Play or bounce a set of stems through the aixel orchestrator")]
pub struct Cli {
    /// Config file to use instead of the one in the user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Play the stems on the default output device.
    Play(PlayArgs),
    /// Render the mix to a WAV file.
    Bounce(BounceArgs),
}

#[derive(Debug, Args)]
pub struct StemArgs {
    /// Audio files, one track each. Mix order follows argument order.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Per-track gain in 0.0..=1.0, comma separated, in file order.
    #[arg(long, value_delimiter = ',')]
    pub gain: Vec<f32>,

    /// Zero-based indices of tracks to solo.
    #[arg(long, value_delimiter = ',')]
    pub solo: Vec<usize>,

    /// Zero-based indices of tracks to mute.
    #[arg(long, value_delimiter = ',')]
    pub mute: Vec<usize>,
}

#[derive(Debug, Args)]
pub struct PlayArgs {
    #[command(flatten)]
    pub stems: StemArgs,

    /// Stop after this many seconds instead of when every stem has ended.
    #[arg(long)]
    pub seconds: Option<f64>,
}

#[derive(Debug, Args)]
pub struct BounceArgs {
    #[command(flatten)]
    pub stems: StemArgs,

    #[arg(long)]
    pub out: PathBuf,

    /// Length of the render.
    #[arg(long)]
    pub seconds: f64,
}
