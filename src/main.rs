use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use nix::libc;
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::unistd::Pid;
use owo_colors::OwoColorize;

mod cache;
mod config;
mod container;
mod engine;
mod error;
mod fs_util;
mod recipe;
mod rootfs;
mod substitute;

use cache::Cache;
use container::Context as ContainerContext;
use engine::Engine;
use recipe::{Namespace, RecipeStatus};

const CACHE_ROOT: &str = ".chariot-cache";

#[derive(Parser)]
#[command(version, about = "cross-compilation bootstrap orchestrator", next_line_help = true)]
struct ChariotOptions {
    #[arg(long, help = "path to the chariot config", default_value = "./config.chariot")]
    config: String,

    #[arg(short, long, help = "log recipe output in realtime")]
    verbose: bool,

    #[arg(long, help = "execute a shell command in the rootfs instead of processing recipes")]
    exec: Option<String>,

    #[arg(help = "namespace/name selectors to force-rebuild, in order")]
    recipes: Vec<String>,
}

extern "C" fn handle_sigint(_: libc::c_int) {
    info!("Terminated chariot process ({})", Pid::this());
    kill(Pid::from_raw(0), Signal::SIGKILL).expect("failed to kill process group");
    exit(130)
}

fn main() {
    init_logging();

    if let Err(err) = run_main() {
        error!("{err}");
        for (i, cause) in err.chain().skip(1).enumerate() {
            error!("  {i}: {cause}");
        }
        exit(1);
    }
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            let level = match record.level() {
                log::Level::Error => "ERROR".red().to_string(),
                log::Level::Warn => "WARN".yellow().to_string(),
                log::Level::Info => "INFO".green().to_string(),
                log::Level::Debug => "DEBUG".blue().to_string(),
                log::Level::Trace => "TRACE".dimmed().to_string(),
            };
            writeln!(buf, "::: {level} {}", record.args())
        })
        .init();
}

/// Fails fast with a clear error if a tool the build engine shells out to
/// from inside the container (`wget`, `tar`, `b2sum`, `bash`, `patch`) isn't
/// present on the host `PATH` used to construct the rootfs, rather than
/// surfacing an opaque exec failure deep into a recipe build.
fn check_host_tools() -> Result<()> {
    for tool in ["wget", "tar", "b2sum", "bash", "patch"] {
        which::which(tool).with_context(|| format!("Required tool `{tool}` not found on PATH"))?;
    }
    Ok(())
}

fn run_main() -> Result<()> {
    let opts = ChariotOptions::parse();

    let handler = SigHandler::Handler(handle_sigint);
    unsafe { signal::signal(Signal::SIGINT, handler) }.context("Failed to install SIGINT handler")?;

    check_host_tools()?;

    let cache = Cache::new(CACHE_ROOT);
    fs_util::make_dir(cache.root()).context("Failed to create chariot cache")?;
    let _lock = fs_util::acquire_lockfile(cache.lockfile_path()).context("Failed to acquire cache lock")?;

    rootfs::ensure_rootfs(&cache)?;

    if let Some(command) = &opts.exec {
        let context = ContainerContext::new(cache.rootfs_dir(), "/root").set_verbose(true);
        return context.exec_shell(command).context("Exec command failed");
    }

    let graph = config::parse(&opts.config).with_context(|| format!("Failed to parse config `{}`", opts.config))?;

    let mut force_list = Vec::new();
    for selector in &opts.recipes {
        match selector.split_once('/') {
            Some((namespace, name)) => {
                let namespace = match namespace {
                    "source" => Namespace::Source,
                    "host" => Namespace::Host,
                    "target" => Namespace::Target,
                    _ => {
                        warn!("Unknown namespace `{namespace}` in selector `{selector}`, ignoring");
                        continue;
                    }
                };
                match graph.find(namespace, name) {
                    Some(id) => {
                        let recipe = graph.get(id);
                        recipe.status.set(RecipeStatus { built: recipe.status.get().built, invalidated: true });
                        force_list.push(id);
                    }
                    None => warn!("Unknown recipe `{selector}`, ignoring"),
                }
            }
            None => warn!("Invalid selector `{selector}`, ignoring"),
        }
    }

    let engine = Engine::new(&cache, &graph, opts.verbose);

    for id in force_list {
        engine.process(id).with_context(|| format!("Failed to build `{}`", graph.get(id).qualified_name()))?;
    }

    Ok(())
}
