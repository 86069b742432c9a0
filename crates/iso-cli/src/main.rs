use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};

use iso_core::time::unix_to_iso8601;
use iso_core::{
    Axis, Bucket, CancelToken, FilterState, Frame, Graph, History, MergeOutcome, Replay,
    ThreadPacer, ValueId, ViewKind, execute, project,
};
use iso_store::{Database, default_data_dir};

#[derive(Parser)]
#[command(name = "iso", about = "Isometry value graph engine CLI")]
struct Cli {
    /// Data directory (overrides ISO_DATA_DIR and ~/.isometry)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a JSON batch of values (array or {"values": [...]})
    Import {
        /// Input file path
        path: PathBuf,
    },

    /// Print one value as JSON
    Get {
        id: String,

        /// Also list the value's facets
        #[arg(long)]
        facets: bool,
    },

    /// Delete a value
    Delete {
        id: String,

        /// Also delete the edges of a node
        #[arg(long)]
        cascade: bool,
    },

    /// Compile a filter state and print its query text
    Compile {
        /// Filter state JSON file ("-" for stdin); defaults to the branch head
        filter: Option<PathBuf>,

        /// Print the executable plan as JSON instead
        #[arg(long)]
        plan: bool,
    },

    /// Run a filter state and print or project the result
    Query {
        /// Filter state JSON file ("-" for stdin); defaults to the branch head
        filter: Option<PathBuf>,

        /// Project the result into a view
        #[arg(long, value_enum)]
        view: Option<ViewArg>,

        /// Facet as axis.name: kanban lanes or timeline time facet
        #[arg(long)]
        by: Option<String>,

        /// Timeline bucket size
        #[arg(long, value_enum, default_value = "day")]
        bucket: BucketArg,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Capture a filter state onto the current branch
    Capture {
        /// Filter state JSON file ("-" for stdin); defaults to an empty state
        filter: Option<PathBuf>,

        #[arg(long)]
        label: Option<String>,
    },

    /// List branches, or fork a new branch at the current head
    Branch { name: Option<String> },

    /// Switch the current branch
    Checkout { name: String },

    /// Fast-forward a branch onto its parent
    Merge { name: String },

    /// Show the snapshots of a branch, oldest first
    Log {
        /// Branch to show; defaults to the current branch
        branch: Option<String>,
    },

    /// Play back snapshots, running each one against the graph
    Replay {
        /// First snapshot index; defaults to the start of the branch
        #[arg(long)]
        from: Option<u64>,

        /// Last snapshot index; defaults to the branch head
        #[arg(long)]
        to: Option<u64>,

        /// Branch to replay; defaults to the current branch
        #[arg(long)]
        branch: Option<String>,

        /// Playback speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },

    /// Export every value as {"values": [...]}
    Export {
        /// Output file; prints to stdout when omitted
        path: Option<PathBuf>,
    },

    /// Export the history as a versioned JSON document
    ExportHistory { path: PathBuf },

    /// Replace the history with a JSON document
    ImportHistory { path: PathBuf },

    /// Show database statistics
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewArg {
    Grid,
    Network,
    Kanban,
    Timeline,
}

#[derive(Clone, Copy, ValueEnum)]
enum BucketArg {
    Day,
    Week,
    Month,
    Year,
}

impl From<BucketArg> for Bucket {
    fn from(b: BucketArg) -> Self {
        match b {
            BucketArg::Day => Bucket::Day,
            BucketArg::Week => Bucket::Week,
            BucketArg::Month => Bucket::Month,
            BucketArg::Year => Bucket::Year,
        }
    }
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir
        .clone()
        .or_else(|| std::env::var("ISO_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir)
}

fn open_db(cli: &Cli) -> Result<Database> {
    let dir = data_dir(cli);
    tracing::debug!("opening database in {}", dir.display());
    Database::open(&dir).with_context(|| format!("failed to open database in {}", dir.display()))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Import { path } => cmd_import(&cli, path),
        Commands::Get { id, facets } => cmd_get(&cli, id, *facets),
        Commands::Delete { id, cascade } => cmd_delete(&cli, id, *cascade),
        Commands::Compile { filter, plan } => cmd_compile(&cli, filter.as_deref(), *plan),
        Commands::Query {
            filter,
            view,
            by,
            bucket,
            json,
        } => cmd_query(&cli, filter.as_deref(), *view, by.as_deref(), *bucket, *json),
        Commands::Capture { filter, label } => cmd_capture(&cli, filter.as_deref(), label.clone()),
        Commands::Branch { name } => cmd_branch(&cli, name.as_deref()),
        Commands::Checkout { name } => cmd_checkout(&cli, name),
        Commands::Merge { name } => cmd_merge(&cli, name),
        Commands::Log { branch } => cmd_log(&cli, branch.as_deref()),
        Commands::Replay {
            from,
            to,
            branch,
            speed,
        } => cmd_replay(&cli, *from, *to, branch.clone(), *speed).await,
        Commands::Export { path } => cmd_export(&cli, path.as_deref()),
        Commands::ExportHistory { path } => cmd_export_history(&cli, path),
        Commands::ImportHistory { path } => cmd_import_history(&cli, path),
        Commands::Stats => cmd_stats(&cli),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Read a filter state from a file or stdin; `None` falls back to the head
/// of the current branch, then to an empty state.
fn read_filter(db: &Database, path: Option<&Path>) -> Result<FilterState> {
    let json = match path {
        Some(p) if p.as_os_str() == "-" => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read filter state from stdin")?;
            buf
        }
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("failed to read {}", p.display()))?,
        None => {
            let history = db.history();
            let head = history
                .head(history.current())
                .context("failed to read branch head")?;
            return Ok(head.map(|s| s.state.clone()).unwrap_or_default());
        }
    };
    serde_json::from_str(&json).context("invalid filter state JSON")
}

/// Parse `axis.name`, e.g. `categorical.status`.
fn parse_facet_key(s: &str) -> Result<(Axis, String)> {
    let (axis, name) = s
        .split_once('.')
        .ok_or_else(|| anyhow!("expected axis.name, got '{s}'"))?;
    let axis: Axis = axis.parse().map_err(|e: String| anyhow!(e))?;
    if name.is_empty() {
        bail!("facet name missing in '{s}'");
    }
    Ok((axis, name.to_string()))
}

fn view_kind(view: ViewArg, by: Option<&str>, bucket: BucketArg) -> Result<ViewKind> {
    Ok(match view {
        ViewArg::Grid => ViewKind::Grid { columns: None },
        ViewArg::Network => ViewKind::Network,
        ViewArg::Kanban => {
            let by = by.context("kanban needs --by axis.name")?;
            let (axis, facet) = parse_facet_key(by)?;
            ViewKind::Kanban { axis, facet }
        }
        ViewArg::Timeline => {
            let facet = match by {
                Some(by) => {
                    let (axis, facet) = parse_facet_key(by)?;
                    if axis != Axis::Temporal {
                        bail!("timeline facets live on the temporal axis, got {axis}");
                    }
                    Some(facet)
                }
                None => None,
            };
            ViewKind::Timeline {
                facet,
                bucket: bucket.into(),
            }
        }
    })
}

fn one_line(text: &str) -> String {
    text.lines().map(str::trim).collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_import(cli: &Cli, path: &Path) -> Result<()> {
    let db = open_db(cli)?;
    let ids = db
        .import_values_file(path)
        .with_context(|| format!("failed to import {}", path.display()))?;
    let stats = db.stats().context("failed to read stats")?;
    println!(
        "imported {} values from {}. nodes={}, edges={}",
        ids.len(),
        path.display(),
        stats.nodes,
        stats.edges
    );
    Ok(())
}

fn cmd_get(cli: &Cli, id: &str, facets: bool) -> Result<()> {
    let db = open_db(cli)?;
    let id = ValueId::from(id);
    let value = db.get(&id).with_context(|| format!("failed to get {id}"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    if facets {
        let graph = db.snapshot();
        for facet in graph.get_facets(&id)? {
            println!("{}.{} = {}", facet.axis, facet.name, facet.value);
        }
    }
    Ok(())
}

fn cmd_delete(cli: &Cli, id: &str, cascade: bool) -> Result<()> {
    let db = open_db(cli)?;
    let removed = db
        .delete(&ValueId::from(id), cascade)
        .with_context(|| format!("failed to delete {id}"))?;
    let listed: Vec<&str> = removed.iter().map(|id| id.as_str()).collect();
    println!("deleted {}: {}", removed.len(), listed.join(", "));
    Ok(())
}

fn cmd_compile(cli: &Cli, filter: Option<&Path>, plan: bool) -> Result<()> {
    let db = open_db(cli)?;
    let state = read_filter(&db, filter)?;
    let compiled = db.compile(&state).context("failed to compile filter state")?;
    if plan {
        println!("{}", serde_json::to_string_pretty(&compiled.plan)?);
    } else {
        println!("{}", compiled.text);
    }
    Ok(())
}

fn cmd_query(
    cli: &Cli,
    filter: Option<&Path>,
    view: Option<ViewArg>,
    by: Option<&str>,
    bucket: BucketArg,
    json: bool,
) -> Result<()> {
    let db = open_db(cli)?;
    let state = read_filter(&db, filter)?;
    let (compiled, result) = db.query(&state, None).context("query failed")?;

    if let Some(view) = view {
        let kind = view_kind(view, by, bucket)?;
        let graph = db.snapshot();
        let projection = project(&graph, &result.ids, &kind).context("projection failed")?;
        println!("{}", serde_json::to_string_pretty(&projection)?);
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if cli.verbose {
        eprintln!("{}", compiled.text);
    }
    let graph = db.snapshot();
    for id in &result.ids {
        let value = graph.get(id)?;
        println!("{}\t{}\t{}", id, value.kind, value.label());
    }
    println!("({} results{})", result.ids.len(), if result.truncated { ", truncated" } else { "" });
    Ok(())
}

fn cmd_capture(cli: &Cli, filter: Option<&Path>, label: Option<String>) -> Result<()> {
    let db = open_db(cli)?;
    let state = match filter {
        Some(_) => read_filter(&db, filter)?,
        None => FilterState::new(),
    };
    // Reject states that cannot compile before they enter history.
    db.compile(&state).context("filter state does not compile")?;
    let index = db.capture(state, label).context("failed to capture")?;
    println!("captured #{index} on {}", db.history().current());
    Ok(())
}

fn cmd_branch(cli: &Cli, name: Option<&str>) -> Result<()> {
    let db = open_db(cli)?;
    match name {
        Some(name) => {
            db.branch(name)
                .with_context(|| format!("failed to create branch {name}"))?;
            println!("switched to new branch {name}");
        }
        None => {
            let history = db.history();
            for branch in history.branches() {
                let marker = if branch.name == history.current() { "*" } else { " " };
                let parent = branch
                    .parent
                    .as_deref()
                    .map(|p| format!(" (from {p} @ {})", branch.base))
                    .unwrap_or_default();
                println!(
                    "{marker} {}{parent}  {} snapshots",
                    branch.name,
                    branch.snapshots.len()
                );
            }
        }
    }
    Ok(())
}

fn cmd_checkout(cli: &Cli, name: &str) -> Result<()> {
    let db = open_db(cli)?;
    db.checkout(name)
        .with_context(|| format!("failed to check out {name}"))?;
    println!("switched to branch {name}");
    Ok(())
}

fn cmd_merge(cli: &Cli, name: &str) -> Result<()> {
    let db = open_db(cli)?;
    match db.merge(name).with_context(|| format!("failed to merge {name}"))? {
        MergeOutcome::FastForward { into, transferred } => {
            println!(
                "fast-forwarded {name} into {into} ({} snapshots)",
                transferred.len()
            );
            Ok(())
        }
        MergeOutcome::Conflict(conflict) => {
            let list = |ids: &[u64]| {
                ids.iter()
                    .map(|i| format!("#{i}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!(
                "conflict: {} moved since {} forked at {}",
                conflict.parent, conflict.branch, conflict.base
            );
            println!("  {}: {}", conflict.parent, list(&conflict.parent_snapshots));
            println!("  {}: {}", conflict.branch, list(&conflict.branch_snapshots));
            bail!("merge of {name} into {} has conflicts", conflict.parent)
        }
    }
}

fn cmd_log(cli: &Cli, branch: Option<&str>) -> Result<()> {
    let db = open_db(cli)?;
    let history = db.history();
    let branch = branch.unwrap_or(history.current());
    let lineage = history
        .lineage(branch)
        .with_context(|| format!("failed to read log of {branch}"))?;
    if lineage.is_empty() {
        println!("(no snapshots on {branch})");
    }
    for index in lineage {
        let Some(snapshot) = history.snapshot(index) else {
            continue;
        };
        let text = db
            .compile(&snapshot.state)
            .map(|c| one_line(&c.text))
            .unwrap_or_else(|e| format!("<{e}>"));
        let label = snapshot
            .label
            .as_deref()
            .map(|l| format!(" [{l}]"))
            .unwrap_or_default();
        println!(
            "#{index} {} {}{label}  {text}",
            unix_to_iso8601(snapshot.captured_at),
            snapshot.branch
        );
    }
    Ok(())
}

/// Resolve defaults for `from`/`to` against the branch lineage.
fn replay_bounds(
    history: &History,
    branch: &str,
    from: Option<u64>,
    to: Option<u64>,
) -> Result<Option<(u64, u64)>> {
    let lineage = history.lineage(branch)?;
    let (Some(&first), Some(&last)) = (lineage.first(), lineage.last()) else {
        return Ok(None);
    };
    Ok(Some((from.unwrap_or(first), to.unwrap_or(last))))
}

/// Compile and run one replayed snapshot. The query always runs to
/// completion; cancellation is only observed between frames.
fn replay_frame(db: &Database, graph: &Graph, frame: &Frame<'_>) -> String {
    let snapshot = frame.snapshot;
    let summary = db
        .compile(&snapshot.state)
        .map_err(anyhow::Error::from)
        .and_then(|compiled| {
            let result = execute(graph, &compiled.plan, None)?;
            Ok(format!("{} results  {}", result.ids.len(), one_line(&compiled.text)))
        })
        .unwrap_or_else(|e| format!("error: {e}"));
    format!(
        "[{}/{}] #{} {summary}",
        frame.position + 1,
        frame.total,
        snapshot.index
    )
}

async fn cmd_replay(
    cli: &Cli,
    from: Option<u64>,
    to: Option<u64>,
    branch: Option<String>,
    speed: f64,
) -> Result<()> {
    let db = Arc::new(open_db(cli)?);
    let history = db.history();
    let branch = branch.unwrap_or_else(|| history.current().to_string());
    let Some((from, to)) = replay_bounds(&history, &branch, from, to)? else {
        println!("(no snapshots on {branch})");
        return Ok(());
    };
    let base = Duration::from_millis(db.config().replay.interval_ms);
    tracing::debug!("replaying {branch} from #{from} to #{to} at {speed}x");

    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let worker_db = Arc::clone(&db);
    let mut handle = tokio::task::spawn_blocking(move || -> Result<_> {
        let replay = Replay::from_history(&history, &branch, from, to, base, speed)
            .context("invalid replay range")?;
        let graph = worker_db.snapshot();
        let outcome = replay.run(&worker_cancel, &mut ThreadPacer, |frame| {
            println!("{}", replay_frame(&worker_db, &graph, &frame));
        });
        Ok(outcome)
    });

    let outcome = tokio::select! {
        joined = &mut handle => joined.context("replay worker panicked")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, stopping replay after the current frame");
            cancel.cancel();
            handle.await.context("replay worker panicked")??
        }
    };

    if outcome.cancelled {
        println!("replay cancelled after {} frames", outcome.emitted);
    } else {
        println!("replayed {} frames", outcome.emitted);
    }
    Ok(())
}

fn cmd_export(cli: &Cli, path: Option<&Path>) -> Result<()> {
    let db = open_db(cli)?;
    let json = db.export_values_string().context("failed to export values")?;
    match path {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("exported values to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_export_history(cli: &Cli, path: &Path) -> Result<()> {
    let db = open_db(cli)?;
    db.export_history_file(path)
        .with_context(|| format!("failed to export history to {}", path.display()))?;
    println!("exported history to {}", path.display());
    Ok(())
}

fn cmd_import_history(cli: &Cli, path: &Path) -> Result<()> {
    let db = open_db(cli)?;
    let count = db
        .import_history_file(path)
        .with_context(|| format!("failed to import history from {}", path.display()))?;
    println!("imported {count} snapshots from {}", path.display());
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let db = open_db(cli)?;
    let stats = db.stats().context("failed to get stats")?;
    let history = db.history();

    println!("nodes:      {}", stats.nodes);
    println!("edges:      {}", stats.edges);
    println!("facets:     {}", stats.facets);
    println!("branches:   {}", history.branches().count());
    println!("snapshots:  {}", history.snapshots().count());
    println!("current:    {}", history.current());
    println!("db_size:    {:.1}MB", db.db_size() as f64 / (1024.0 * 1024.0));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso_core::{EngineConfig, MAIN_BRANCH, Value};

    #[test]
    fn test_parse_facet_key() {
        let (axis, name) = parse_facet_key("categorical.status").unwrap();
        assert_eq!(axis, Axis::Categorical);
        assert_eq!(name, "status");
        assert!(parse_facet_key("status").is_err());
        assert!(parse_facet_key("colour.status").is_err());
        assert!(parse_facet_key("ordinal.").is_err());
    }

    #[test]
    fn test_timeline_requires_temporal_facet() {
        assert!(view_kind(ViewArg::Timeline, Some("lexical.title"), BucketArg::Day).is_err());
        let kind = view_kind(ViewArg::Timeline, Some("temporal.due"), BucketArg::Week).unwrap();
        assert_eq!(
            kind,
            ViewKind::Timeline {
                facet: Some("due".into()),
                bucket: Bucket::Week
            }
        );
    }

    #[test]
    fn test_kanban_requires_facet() {
        assert!(view_kind(ViewArg::Kanban, None, BucketArg::Day).is_err());
    }

    #[test]
    fn test_replay_bounds_default_to_lineage() {
        let mut history = History::new();
        assert_eq!(replay_bounds(&history, "main", None, None).unwrap(), None);
        let a = history.capture(FilterState::new(), None);
        let b = history.capture(FilterState::new(), None);
        assert_eq!(
            replay_bounds(&history, "main", None, None).unwrap(),
            Some((a, b))
        );
        assert_eq!(
            replay_bounds(&history, "main", Some(b), Some(a)).unwrap(),
            Some((b, a))
        );
    }

    #[test]
    fn test_cancel_during_frame_still_delivers_it() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        db.put_batch(vec![Value::node("a"), Value::node("b")]).unwrap();

        let mut history = History::new();
        let first = history.capture(FilterState::new(), None);
        let last = history.capture(FilterState::new(), None);
        let replay =
            Replay::from_history(&history, MAIN_BRANCH, first, last, Duration::ZERO, 1.0).unwrap();

        let cancel = CancelToken::new();
        let graph = db.snapshot();
        let mut lines = Vec::new();
        let outcome = replay.run(&cancel, &mut ThreadPacer, |frame| {
            // Interrupt arrives while the frame is being processed.
            cancel.cancel();
            lines.push(replay_frame(&db, &graph, &frame));
        });

        assert!(outcome.cancelled);
        assert_eq!(outcome.emitted, 1);
        assert_eq!(lines, vec![format!("[1/2] #{first} 2 results  FIND values")]);
    }

    #[test]
    fn test_one_line() {
        assert_eq!(one_line("FIND values\nWHERE x\n  AND y"), "FIND values WHERE x AND y");
    }
}
