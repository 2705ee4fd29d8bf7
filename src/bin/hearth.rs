// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use hearth::{
    engine::Conflicts,
    path::{default_hearth_dir, home_dir},
    status,
    store::{Layout, RepoList},
    update::{
        add_repository, forget_repositories, run_update, select_repositories, UpdateOptions,
        UpdateReport,
    },
    TomlScript,
};

use anyhow::{anyhow, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::{io::IsTerminal, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "hearth [options] <hearth-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Produce extra output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Never prompt for input, e.g., for sudo or credentials.
    #[arg(short, long, global = true)]
    pub no_interactive: bool,
}

impl Cli {
    async fn run(self) -> Result<i32> {
        let interactive =
            !self.no_interactive && std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
        let layout = Layout::open(default_hearth_dir()?)?;
        let mut options = UpdateOptions::new(home_dir()?);
        options.interactive = interactive;

        match self.command {
            Command::Add(opts) => run_add(layout, options, opts).await,
            Command::Repolist(opts) => run_repolist(layout, opts),
            Command::Forget(opts) => run_forget(layout, options, opts).await,
            Command::Update(opts) => run_update_command(layout, options, opts).await,
            Command::Autoupdate(opts) => run_autoupdate(layout, opts),
            Command::Updatestatus => run_updatestatus(layout),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Register source repository, and run its script right away.
    #[command(override_usage = "hearth add [options] <repo> [<dest>]")]
    Add(AddOptions),

    /// List registered source repositories.
    #[command(override_usage = "hearth repolist [options]")]
    Repolist(RepolistOptions),

    /// Forget about registered source repositories.
    #[command(override_usage = "hearth forget [options] <repo>...")]
    Forget(ForgetOptions),

    /// Pull source repositories, run their scripts, and clean up.
    #[command(override_usage = "hearth update [options] [<repo>]...")]
    Update(UpdateCommandOptions),

    /// Control automatic updates.
    #[command(override_usage = "hearth autoupdate (--pause | --unpause | --clear)")]
    Autoupdate(AutoupdateOptions),

    /// Report status of current or previous update through exit code.
    #[command(override_usage = "hearth updatestatus")]
    Updatestatus,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddOptions {
    /// Path to local repository, or URL of remote repository.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Where to clone remote repository.
    #[arg(value_name = "dest")]
    pub dest: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RepolistOptions {
    /// Output format with {repoid}, {shortid}, {localpath}, and {canonical}
    /// replacements.
    #[arg(short, long, value_name = "format")]
    pub format: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ForgetOptions {
    /// Repository id, local path, or canonical URL.
    #[arg(required = true, value_name = "repo")]
    pub repos: Vec<String>,

    /// Run full update right away to clean up after forgotten repositories.
    #[arg(short, long)]
    pub cleanup: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateCommandOptions {
    /// Only update these repositories, which disables cleanup.
    #[arg(value_name = "repo")]
    pub repos: Vec<String>,

    /// Do not pull repositories, or anything else over the network.
    #[arg(long)]
    pub nopull: bool,

    /// Only run named sections.
    #[arg(short, long, value_name = "section", conflicts_with = "skip")]
    pub only: Vec<String>,

    /// Skip named sections.
    #[arg(short, long, value_name = "section")]
    pub skip: Vec<String>,

    /// What cleanup does when something still wants a stale path: raise,
    /// warn, ask, or postpone.
    #[arg(long, value_name = "policy", default_value = "postpone", value_parser = parse_conflicts)]
    pub conflicts: Conflicts,
}

#[derive(Parser, Clone, Debug)]
#[command(
    author,
    about,
    long_about,
    group(ArgGroup::new("action").required(true).args(["pause", "unpause", "clear"]))
)]
struct AutoupdateOptions {
    /// Pause automatic updates.
    #[arg(long)]
    pub pause: bool,

    /// Resume automatic updates.
    #[arg(long)]
    pub unpause: bool,

    /// Forget failure of previous update.
    #[arg(long)]
    pub clear: bool,
}

fn parse_conflicts(data: &str) -> std::result::Result<Conflicts, String> {
    data.parse().map_err(|error: hearth::engine::EngineError| error.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "info" };
    let layer = fmt::layer().compact().with_target(false).without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match cli.run().await {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

async fn run_add(layout: Layout, mut options: UpdateOptions, opts: AddOptions) -> Result<i32> {
    let added = add_repository(&layout, &opts.repo, opts.dest.as_deref(), &options)?;
    if added.existed {
        info!(
            "repository [{}] at {} was already added",
            added.entry.short_id(),
            added.entry.local_path.display()
        );
    }

    options.pull = false;
    update_blocking(layout, vec![added.entry], options).await
}

fn run_repolist(layout: Layout, opts: RepolistOptions) -> Result<i32> {
    let format = opts
        .format
        .unwrap_or_else(|| "[{shortid}] {localpath} {canonical}".into());
    for entry in RepoList::load(&layout)?.iter() {
        let line = format
            .replace("{repoid}", &entry.repo_id)
            .replace("{shortid}", entry.short_id())
            .replace("{localpath}", &entry.local_path.to_string_lossy())
            .replace("{canonical}", entry.canonical.as_deref().unwrap_or_default());
        println!("{}", line.trim_end());
    }

    Ok(0)
}

async fn run_forget(layout: Layout, mut options: UpdateOptions, opts: ForgetOptions) -> Result<i32> {
    let forgotten = forget_repositories(&layout, &opts.repos)?;
    if !forgotten.unknown.is_empty() {
        return Err(anyhow!("no repositories match {:?}", forgotten.unknown));
    }

    if !opts.cleanup {
        return Ok(0);
    }

    options.pull = false;
    let repos = select_repositories(&layout, &[])?;
    update_blocking(layout, repos, options).await
}

async fn run_update_command(
    layout: Layout,
    mut options: UpdateOptions,
    opts: UpdateCommandOptions,
) -> Result<i32> {
    options.pull = !opts.nopull;
    options.only = opts.only;
    options.skip = opts.skip;
    options.conflicts = opts.conflicts;

    let repos = select_repositories(&layout, &opts.repos)?;
    update_blocking(layout, repos, options).await
}

fn run_autoupdate(layout: Layout, opts: AutoupdateOptions) -> Result<i32> {
    if opts.pause {
        status::pause(&layout)?;
    } else if opts.unpause {
        status::unpause(&layout)?;
    } else if opts.clear {
        status::clear_failure(&layout)?;
    }

    Ok(0)
}

fn run_updatestatus(layout: Layout) -> Result<i32> {
    let status = status::get_status(&layout)?;
    info!("update status: {status}");

    Ok(status.exit_code())
}

async fn update_blocking(
    layout: Layout,
    repos: Vec<hearth::RepoEntry>,
    options: UpdateOptions,
) -> Result<i32> {
    let task_layout = layout.clone();
    let task = tokio::task::spawn_blocking(move || {
        run_update(&task_layout, &repos, &options, &TomlScript::default())
    });

    tokio::select! {
        result = task => report(result??),
        _ = tokio::signal::ctrl_c() => {
            status::record_interrupted(&layout)?;
            error!("update interrupted");
            exit(130);
        }
    }
}

fn report(report: UpdateReport) -> Result<i32> {
    info!("{} changes made", report.changes);
    if report.is_success() {
        return Ok(0);
    }

    for warning in &report.warnings {
        warn!("{warning}");
    }

    Err(anyhow!(
        "update finished with {} warnings",
        report.warnings.len()
    ))
}
