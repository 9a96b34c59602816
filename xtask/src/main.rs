use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for voxelcore")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// fmt, clippy, tests, doc and the CLI smoke run
    Check,
    /// cargo fmt --check over the workspace
    Fmt,
    /// Clippy with warnings denied
    Clippy,
    /// Run tests for the workspace or one crate
    Test {
        #[arg(short, long, value_enum)]
        crate_name: Option<Member>,
        /// Forwarded to the test binaries as a name filter
        filter: Option<String>,
    },
    /// Build rustdoc for the library crates
    Doc,
    /// Run benchmarks in release mode
    Bench {
        #[arg(short, long, value_enum, default_value = "stream")]
        crate_name: Member,
    },
    /// Save, verify and reload a world with the voxelcore CLI, then run a
    /// small convergence round
    Smoke {
        /// Keep the world directory instead of a throwaway one
        #[arg(long)]
        keep: Option<std::path::PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Member {
    Common,
    Kernel,
    Mesh,
    Stream,
    Persist,
    Sync,
    Cli,
}

impl Member {
    fn package(self) -> &'static str {
        match self {
            Member::Common => "voxelcore-common",
            Member::Kernel => "voxelcore-kernel",
            Member::Mesh => "voxelcore-mesh",
            Member::Stream => "voxelcore-stream",
            Member::Persist => "voxelcore-persist",
            Member::Sync => "voxelcore-sync",
            Member::Cli => "voxelcore-cli",
        }
    }

    fn has_benches(self) -> bool {
        matches!(self, Member::Stream)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            fmt()?;
            clippy()?;
            test(None, None)?;
            doc()?;
            smoke(None)?;
        }
        Commands::Fmt => fmt()?,
        Commands::Clippy => clippy()?,
        Commands::Test { crate_name, filter } => test(crate_name, filter.as_deref())?,
        Commands::Doc => doc()?,
        Commands::Bench { crate_name } => bench(crate_name)?,
        Commands::Smoke { keep } => smoke(keep.as_deref())?,
    }

    Ok(())
}

/// Run `cargo` with `args`, failing with `step` in the message.
fn cargo<I, S>(step: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    println!("==> {step}");
    let status = Command::new("cargo")
        .args(args)
        .status()
        .with_context(|| format!("failed to spawn cargo for {step}"))?;
    if !status.success() {
        bail!("{step} failed ({status})");
    }
    Ok(())
}

fn fmt() -> Result<()> {
    cargo("cargo fmt --check", ["fmt", "--all", "--", "--check"])
}

fn clippy() -> Result<()> {
    cargo(
        "cargo clippy",
        ["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )
}

fn test(member: Option<Member>, filter: Option<&str>) -> Result<()> {
    let mut args = vec!["test"];
    match member {
        Some(member) => args.extend(["-p", member.package()]),
        None => args.push("--workspace"),
    }
    if let Some(filter) = filter {
        args.push(filter);
    }
    let step = match member {
        Some(member) => format!("tests for {}", member.package()),
        None => "workspace tests".to_string(),
    };
    cargo(&step, args)
}

fn doc() -> Result<()> {
    cargo(
        "cargo doc",
        ["doc", "--workspace", "--no-deps", "--exclude", "xtask"],
    )
}

fn bench(member: Member) -> Result<()> {
    if !member.has_benches() {
        bail!("{} has no benchmarks", member.package());
    }
    cargo(
        &format!("benchmarks for {}", member.package()),
        ["bench", "-p", member.package()],
    )
}

fn smoke(keep: Option<&Path>) -> Result<()> {
    let scratch;
    let root = match keep {
        Some(dir) => dir.to_path_buf(),
        None => {
            scratch = tempfile::tempdir().context("failed to create scratch directory")?;
            scratch.path().to_path_buf()
        }
    };
    let world = root.join("smoke");
    let world = world
        .to_str()
        .context("scratch path is not valid UTF-8")?;
    let run = ["run", "--quiet", "-p", "voxelcore-cli", "--"];

    let save = [
        "save", world, "--name", "smoke", "--generator", "flat", "--edits", "8", "--undo", "2",
    ];
    cargo("voxelcore save", run.iter().chain(save.iter()))?;
    cargo("voxelcore verify", run.iter().chain(["verify", world].iter()))?;
    cargo("voxelcore load", run.iter().chain(["load", world].iter()))?;
    let list = root.to_str().context("scratch path is not valid UTF-8")?;
    cargo("voxelcore list", run.iter().chain(["list", list].iter()))?;
    cargo(
        "voxelcore converge",
        run.iter()
            .chain(["converge", "--peers", "3", "--edits", "32"].iter()),
    )?;
    println!("smoke run passed in {}", root.display());
    Ok(())
}
