use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clonegen::config::{
    ConfigError, EffectiveConfig, Overrides, default_global_config_yaml, default_repo_config_yaml,
    expand_tilde, load_effective_config,
};
use clonegen::detect::{
    StageError, StageReport, run_all, run_clone_links, run_clones, run_fragment_links,
    run_fragments, run_genealogies,
};
use clonegen::history::{
    ImportError, ImportOptions, read_git_history, read_snapshot_history, register_history,
};
use clonegen::index::lineage::{ElementKind, Link};
use clonegen::index::{SharedIndex, SqliteIndex};
use clonegen::pipeline::PipelineSettings;
use clonegen::query::{GenealogyView, genealogy_of};
use clonegen::vcs::{GitRepository, VcsError};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CLONEGEN_LOG";
const LOG_DEFAULT: &str = "clonegen=info";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(value: rusqlite::Error) -> Self {
        Self::new("sqlite_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<VcsError> for CliError {
    fn from(value: VcsError) -> Self {
        Self::new("vcs_error", value.to_string())
    }
}

impl From<ImportError> for CliError {
    fn from(value: ImportError) -> Self {
        let code = match value {
            ImportError::AlreadyImported(_) => "already_imported",
            ImportError::Empty(_) => "empty_history",
            ImportError::Vcs(_) => "vcs_error",
            ImportError::Sqlite(_) => "sqlite_error",
            ImportError::Io { .. } | ImportError::Walk(_) => "read_error",
        };
        Self::new(code, value.to_string())
    }
}

impl From<StageError> for CliError {
    fn from(value: StageError) -> Self {
        let code = match value {
            StageError::Sqlite(_) => "sqlite_error",
            StageError::Monitor(_) => "persist_error",
            StageError::Genealogy(_) => "genealogy_error",
        };
        Self::new(code, value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "clonegen")]
#[command(about = "Mines code-clone genealogies from a version history")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Import(ImportArgs),
    Fragments(StageArgs),
    Clones(StageArgs),
    LinkFragments(StageArgs),
    LinkClones(StageArgs),
    Genealogies(GenealogiesArgs),
    Run(StageArgs),
    Genealogy(GenealogyArgs),
    Stats,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Directory whose subdirectories are revisions, in name order.
    #[arg(long, conflicts_with = "git", required_unless_present = "git")]
    snapshots: Option<PathBuf>,
    /// Git work tree whose first-parent history is replayed.
    #[arg(long)]
    git: Option<PathBuf>,
    #[arg(long, default_value = clonegen::history::DEFAULT_REPOSITORY)]
    repository: String,
    /// The first path component of every file names its repository.
    #[arg(long)]
    combined: bool,
}

#[derive(Args, Debug)]
struct StageArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    flush_threshold: Option<usize>,
    #[arg(long)]
    interval_ms: Option<u64>,
    #[arg(long)]
    cross_project: bool,
}

impl StageArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            workers: self.workers,
            flush_threshold: self.flush_threshold,
            interval_ms: self.interval_ms,
            cross_project: self.cross_project,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindChoice {
    Fragment,
    Clone,
    All,
}

#[derive(Args, Debug)]
struct GenealogiesArgs {
    #[arg(long, value_enum, default_value_t = KindChoice::All)]
    kind: KindChoice,
    #[command(flatten)]
    stage: StageArgs,
}

#[derive(Args, Debug)]
struct GenealogyArgs {
    kind: String,
    element: i64,
}

#[derive(Debug, Clone)]
struct RepoPaths {
    root: PathBuf,
    index: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(LOG_DEFAULT));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = repo_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Import(args) => cmd_import(&cwd, &paths, args),
        Command::Fragments(args) => {
            cmd_stage(&cwd, &paths, &args, |index, settings| {
                Ok(vec![run_fragments(index, settings)?])
            })
        }
        Command::Clones(args) => cmd_stage(&cwd, &paths, &args, |index, settings| {
            Ok(vec![run_clones(index, settings)?])
        }),
        Command::LinkFragments(args) => cmd_stage(&cwd, &paths, &args, |index, settings| {
            Ok(vec![run_fragment_links(index, settings)?])
        }),
        Command::LinkClones(args) => cmd_stage(&cwd, &paths, &args, |index, settings| {
            Ok(vec![run_clone_links(index, settings)?])
        }),
        Command::Genealogies(args) => {
            let kinds = match args.kind {
                KindChoice::Fragment => vec![ElementKind::Fragment],
                KindChoice::Clone => vec![ElementKind::Clone],
                KindChoice::All => vec![ElementKind::Fragment, ElementKind::Clone],
            };
            cmd_stage(&cwd, &paths, &args.stage, |index, settings| {
                kinds
                    .iter()
                    .map(|kind| run_genealogies(index, *kind, settings))
                    .collect()
            })
        }
        Command::Run(args) => cmd_stage(&cwd, &paths, &args, run_all),
        Command::Genealogy(args) => cmd_genealogy(&paths, args),
        Command::Stats => cmd_stats(&paths),
    }
}

fn cmd_init(paths: &RepoPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let _ = SqliteIndex::open(&path_string(&paths.index))?;
    write_default_config(paths)?;

    print_json(&json!({
        "status": "ok",
        "root": path_string(&paths.root),
        "index": path_string(&paths.index),
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_import(cwd: &Path, paths: &RepoPaths, args: ImportArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = effective_config(cwd, paths, &Overrides::default())?;
    let language = config.language()?;
    let options = ImportOptions {
        repository: args.repository,
        combined: args.combined,
    };

    let home = home_dir()?;
    let resolve = |path: &Path| cwd.join(expand_tilde(&path_string(path), &home));

    let history = match (&args.snapshots, &args.git) {
        (Some(root), _) => read_snapshot_history(&resolve(root.as_path()), &options, &language)?,
        (None, Some(root)) => {
            let repo = GitRepository::open(resolve(root.as_path()))?;
            read_git_history(&repo, &options, &language)?
        }
        (None, None) => {
            return Err(CliError::new(
                "invalid_arguments",
                "import needs --snapshots <dir> or --git <path>",
            ));
        }
    };

    let index = SqliteIndex::open(&path_string(&paths.index))?;
    let report = register_history(&index, &options, &history)?;
    print_json(&serde_json::to_value(report)?)
}

fn cmd_stage<F>(cwd: &Path, paths: &RepoPaths, args: &StageArgs, stages: F) -> Result<(), CliError>
where
    F: FnOnce(&SharedIndex, &PipelineSettings) -> Result<Vec<StageReport>, StageError>,
{
    require_initialized_paths(paths)?;
    let config = effective_config(cwd, paths, &args.overrides())?;
    let settings = config.settings();
    info!(
        workers = settings.workers,
        flush_threshold = settings.flush_threshold,
        "pipeline settings"
    );
    let index = SharedIndex::new(SqliteIndex::open(&path_string(&paths.index))?);
    let reports = stages(&index, &settings)?;
    let rendered = reports.iter().map(StageReport::to_json).collect::<Vec<_>>();
    print_json(&json!({ "stages": rendered }))
}

fn cmd_genealogy(paths: &RepoPaths, args: GenealogyArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let kind = ElementKind::parse(&args.kind).ok_or_else(|| {
        CliError::new(
            "invalid_kind",
            format!("unknown element kind `{}`; expected fragment or clone", args.kind),
        )
    })?;
    let index = SqliteIndex::open(&path_string(&paths.index))?;
    let Some(view) = genealogy_of(&index, kind, args.element)? else {
        return Err(CliError::new(
            "not_found",
            format!("no {} genealogy contains element {}", kind.as_str(), args.element),
        ));
    };
    print_json(&genealogy_to_json(&view))
}

fn cmd_stats(paths: &RepoPaths) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let index = SqliteIndex::open(&path_string(&paths.index))?;
    let runs = index
        .runs()?
        .into_iter()
        .map(|run| {
            json!({
                "id": run.id,
                "stage": run.stage,
                "started_at": run.started_at,
                "finished_at": run.finished_at,
                "report": run.counts,
            })
        })
        .collect::<Vec<_>>();
    print_json(&json!({
        "counts": index.counts()?,
        "runs": runs,
    }))
}

fn genealogy_to_json(view: &GenealogyView) -> Value {
    let genealogy = &view.genealogy;
    json!({
        "id": genealogy.id,
        "kind": genealogy.kind.as_str(),
        "start_revision": genealogy.start_revision,
        "end_revision": genealogy.end_revision,
        "elements": genealogy.elements,
        "links": genealogy.links,
        "trivial": genealogy.is_trivial(),
        "trail": view.trail.iter().map(link_to_json).collect::<Vec<_>>(),
    })
}

fn link_to_json(link: &Link) -> Value {
    json!({
        "id": link.id,
        "before_element": link.before_element,
        "after_element": link.after_element,
        "before_revision": link.before_revision,
        "after_revision": link.after_revision,
        "changed": link.changed,
    })
}

fn effective_config(
    cwd: &Path,
    paths: &RepoPaths,
    overrides: &Overrides,
) -> Result<EffectiveConfig, CliError> {
    let config = load_effective_config(cwd, Some(&paths.repo_config), Some(&paths.user_config))?;
    Ok(config.with_overrides(overrides)?)
}

fn repo_paths(cwd: &Path, global: bool) -> Result<RepoPaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(".clonegen"), StorageMode::Global)
    } else {
        (cwd.join(".clonegen"), StorageMode::RepoLocal)
    };

    Ok(RepoPaths {
        index: root.join("index.sqlite"),
        repo_config: cwd.join(".clonegen").join("config.yml"),
        user_config: home.join(".clonegen").join("config.yml"),
        root,
        mode,
    })
}

fn require_initialized_paths(paths: &RepoPaths) -> Result<(), CliError> {
    if !paths.root.exists() || !paths.index.exists() {
        return Err(CliError::new(
            "not_initialized",
            "index is not initialized; run `clonegen init`",
        ));
    }
    Ok(())
}

fn write_default_config(paths: &RepoPaths) -> Result<(), CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    let default = match paths.mode {
        StorageMode::RepoLocal => default_repo_config_yaml(),
        StorageMode::Global => default_global_config_yaml(),
    };
    fs::write(config_path, default).map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
