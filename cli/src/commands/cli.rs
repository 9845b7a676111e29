use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "modelyard", version, about = "Local data-modeling projects")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct InitArgs {
    /// Project directory; created when missing.
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Existing SQLite database to attach instead of `<project>/modelyard.db`.
    #[arg(long = "db")]
    pub db: Option<PathBuf>,

    /// Copy `--db` into the project instead of referencing it in place.
    #[arg(long, requires = "db")]
    pub copy: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ImportTableArgs {
    /// CSV, TSV or JSON source file.
    pub file: PathBuf,

    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// Table name; defaults to the sanitized file stem.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DropTableArgs {
    pub name: String,

    #[arg(long, default_value = ".")]
    pub project: PathBuf,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// Address for remote peers (newline-delimited JSON over TCP).
    #[arg(long, default_value = "127.0.0.1:7711")]
    pub listen: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or update a project.
    Init(InitArgs),
    /// Load a source file as a table and profile it.
    ImportTable(ImportTableArgs),
    /// Remove a table and its profile.
    DropTable(DropTableArgs),
    /// Keep files and state in sync and accept remote peers until Ctrl-C.
    Serve(ServeArgs),
}

impl Commands {
    /// Project directory the command operates on.
    pub fn project_dir(&self) -> &PathBuf {
        match self {
            Self::Init(a) => &a.path,
            Self::ImportTable(a) => &a.project,
            Self::DropTable(a) => &a.project,
            Self::Serve(a) => &a.project,
        }
    }
}
