use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

/// Installer/updater surface. Short flags match what wrapper scripts and
/// silent deployments have historically passed.
#[derive(Parser, Debug, Clone)]
#[command(name = "kachina-installer", version, about = "Self-addressable application installer")]
pub struct InstallerCli {
    #[arg(short = 'D', long = "target", help = "Install directory")]
    pub target: Option<PathBuf>,
    #[arg(short = 'S', long = "silent", help = "Silent install")]
    pub silent: bool,
    #[arg(short = 'I', long = "non-interactive", help = "Non-interactive install")]
    pub non_interactive: bool,
    #[arg(short = 'O', long = "online", help = "Force online install")]
    pub online: bool,
    #[arg(short = 'U', long = "uninstall", help = "Uninstall")]
    pub uninstall: bool,
    #[arg(long = "source", help = "Override the update source")]
    pub source: Option<String>,
    #[arg(long = "dfs-extras", hide = true)]
    pub dfs_extras: Option<String>,
}

#[derive(Parser, Debug)]
#[command(
    name = "kachina-builder",
    version,
    about = "Build, diff and pack self-addressable installer packages",
    arg_required_else_help = true
)]
pub struct BuilderCli {
    #[command(subcommand)]
    pub command: BuilderCommand,
}

#[derive(Subcommand, Debug)]
pub enum BuilderCommand {
    /// Pack a stub, config and staged payloads into one executable
    Pack(PackArgs),
    /// Hash a tree, stage compressed payloads and emit the manifest
    Gen(GenArgs),
    /// Inspect or unpack an existing package
    Extract(ExtractArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PackArgs {
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    #[arg(short = 'm', long = "metadata")]
    pub metadata: Option<PathBuf>,
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    /// Installer stub to prepend; defaults to this builder's own binary
    #[arg(long = "stub")]
    pub stub: Option<PathBuf>,
    /// Theme asset embedded as the `\0THEME` segment
    #[arg(long = "theme")]
    pub theme: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct GenArgs {
    #[arg(short = 'j', long = "jobs", default_value_t = 4)]
    pub jobs: usize,
    #[arg(short = 'i', long = "input-dir")]
    pub input_dir: PathBuf,
    #[arg(short = 'm', long = "metadata")]
    pub output_metadata: PathBuf,
    /// Prior version trees to diff against; repeatable
    #[arg(short = 'd', long = "diff-from")]
    pub diff_dirs: Vec<PathBuf>,
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: PathBuf,
    #[arg(short = 't', long = "tag")]
    pub tag: String,
    /// Updater executable staged as the installer payload
    #[arg(short = 'u', long = "updater")]
    pub updater: Option<PathBuf>,
    #[arg(long = "algorithm", default_value = "xxh")]
    pub algorithm: String,
}

#[derive(Args, Debug, Clone)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["list", "all", "meta_name", "name"])
))]
pub struct ExtractArgs {
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    #[arg(long = "list")]
    pub list: bool,
    #[arg(long = "all", value_name = "OUT_DIR")]
    pub all: Option<PathBuf>,
    #[arg(long = "meta-name", value_name = "SEGMENT")]
    pub meta_name: Option<String>,
    #[arg(long = "name", value_name = "HASH")]
    pub name: Option<String>,
}
