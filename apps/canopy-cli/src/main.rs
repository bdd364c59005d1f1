//! # canopy-cli
//!
//! Works on trees saved with `Tree::save`: import a JSON document into a new
//! tree file, read and edit it by path, merge two replicas' files, validate,
//! compact and fingerprint nodes. `demo` walks through the convergence
//! scenarios on in-memory replicas.
//!
//! ```text
//! canopy-cli import doc.json --out alice.tree --replica alice
//! cp alice.tree bob.tree
//! canopy-cli set bob.tree /title '"final"' --replica bob
//! canopy-cli merge alice.tree bob.tree
//! canopy-cli get alice.tree /title
//! ```

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use canopy_sdk::{NodeEventKind, Replica, ReplicaConfigBuilder};
use canopy_tree::{NodeType, ReplicaId, Scalar, Tree, TreeError};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "canopy-cli")]
#[command(about = "Inspect, edit and merge replicated JSON trees")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a JSON file into a new tree file
    Import {
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "cli")]
        replica: String,
    },
    /// Print a tree as JSON
    Export {
        tree: PathBuf,
        /// Single-line output
        #[arg(long)]
        compact: bool,
    },
    /// Print the value at a path such as /friends/0/name
    Get { tree: PathBuf, path: String },
    /// Overwrite the literal at a path with a JSON scalar
    Set {
        tree: PathBuf,
        path: String,
        value: String,
        #[arg(long, default_value = "cli")]
        replica: String,
    },
    /// Two-way sync of two tree files; both files are rewritten
    Merge {
        local: PathBuf,
        remote: PathBuf,
        /// Write the merged local tree here instead of over `local`
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Check the structural invariants of a tree file
    Validate { tree: PathBuf },
    /// Drop tombstoned and detached nodes
    Tidy { tree: PathBuf },
    /// Print the canonical digest of the node at a path
    Digest { tree: PathBuf, path: String },
    /// Scripted convergence scenarios on in-memory replicas
    Demo,
}

// ─── File helpers ──────────────────────────────────────────────────────────

fn load(path: &Path) -> CliResult<Tree> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {}", path.display(), err))?;
    Ok(Tree::load(&raw)?)
}

fn store(tree: &Tree, path: &Path) -> CliResult<()> {
    fs::write(path, tree.save()?)
        .map_err(|err| format!("cannot write {}: {}", path.display(), err))?;
    tracing::debug!(path = %path.display(), nodes = tree.node_count(), "saved tree");
    Ok(())
}

fn parse_scalar(raw: &str) -> CliResult<Scalar> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| format!("value must be JSON, e.g. '\"text\"' or 42: {}", err))?;
    Scalar::from_json(&value).ok_or_else(|| "value must be a JSON scalar".into())
}

fn ok(text: &str) {
    println!("{} {}", "✓".bright_green(), text);
}

// ─── Commands ──────────────────────────────────────────────────────────────

fn run_import(input: &Path, out: &Path, replica: &str) -> CliResult<()> {
    let raw = fs::read(input).map_err(|err| format!("cannot read {}: {}", input.display(), err))?;
    let mut tree = Tree::new();
    tree.import_json(&raw, &ReplicaId::from(replica))?;
    store(&tree, out)?;
    ok(&format!(
        "imported {} nodes into {}",
        tree.node_count(),
        out.display().to_string().bright_white()
    ));
    Ok(())
}

fn run_export(path: &Path, compact: bool) -> CliResult<()> {
    let tree = load(path)?;
    if compact {
        println!("{}", tree.export_value()?);
    } else {
        println!("{}", String::from_utf8(tree.export_json()?)?);
    }
    Ok(())
}

fn run_get(path: &Path, pointer: &str) -> CliResult<()> {
    let tree = load(path)?;
    let value = tree.get_value_by_path(pointer)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_set(path: &Path, pointer: &str, raw: &str, replica: &str) -> CliResult<()> {
    let value = parse_scalar(raw)?;
    let config = ReplicaConfigBuilder::new().replica_id(replica).build();
    let handle = Replica::open(config, path)?;
    handle.set_value(pointer, value.clone())?;
    handle.save_to(path)?;
    ok(&format!("{} = {}", pointer.bright_yellow(), value));
    Ok(())
}

fn run_merge(local_path: &Path, remote_path: &Path, out: Option<&Path>) -> CliResult<()> {
    let mut local = load(local_path)?;
    let mut remote = load(remote_path)?;
    let report = local.sync_with(&mut remote)?;
    let version = match local.semantic_version() {
        Ok(hex) => hex[..12].to_string(),
        Err(TreeError::EmptyTree) => "empty".to_string(),
        Err(err) => return Err(err.into()),
    };

    let target = out.unwrap_or(local_path);
    store(&local, target)?;
    store(&remote, remote_path)?;

    println!("  {} {}", "pulled:".bright_cyan(), report.pulled);
    println!("  {} {}", "pushed:".bright_cyan(), report.pushed);
    ok(&format!(
        "{} and {} converged (version {})",
        target.display(),
        remote_path.display(),
        version
    ));
    Ok(())
}

fn run_validate(path: &Path) -> CliResult<()> {
    let tree = load(path)?;
    tree.validate()?;
    ok(&format!("{} is well formed ({} nodes)", path.display(), tree.node_count()));
    Ok(())
}

fn run_tidy(path: &Path) -> CliResult<()> {
    let mut tree = load(path)?;
    let report = tree.tidy();
    store(&tree, path)?;
    ok(&format!(
        "removed {} nodes and {} edges",
        report.removed_nodes, report.removed_edges
    ));
    Ok(())
}

fn run_digest(path: &Path, pointer: &str) -> CliResult<()> {
    let tree = load(path)?;
    let node = tree.get_node_by_path(pointer)?;
    println!("{}  {}", node.canonical_digest().to_hex(), node.id().to_string().dimmed());
    Ok(())
}

// ─── Demo ──────────────────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show(name: &str, tree: &Tree) {
    let value = tree
        .export_value()
        .map(|v| v.to_string())
        .unwrap_or_else(|_| "(empty)".to_string());
    println!("  {:>8} {}", name.bright_magenta(), value);
}

fn verdict(converged: bool) {
    if converged {
        println!("  {} {}", "✓".bright_green().bold(), "converged".bright_green().bold());
    } else {
        println!("  {} {}", "✗".bright_red().bold(), "replicas differ".bright_red().bold());
    }
}

fn demo_sibling_insert() -> CliResult<()> {
    section("Sibling-relative insert");
    let alice = ReplicaId::from("alice");
    let mut tree = Tree::new();
    tree.import_json(br#"["A", "B", "D"]"#, &alice)?;
    let arr = tree.get_node_by_path("/")?.id().clone();
    let d = tree.get_node_by_path("/2")?.id().clone();

    let c = tree.create_node("literal", NodeType::Literal, &alice)?;
    tree.set_literal(&c, "C", &alice)?;
    tree.insert_edge_left(&arr, &c, "", &d, &alice)?;
    step("insert \"C\" left of \"D\"");
    show("alice", &tree);
    Ok(())
}

fn demo_concurrent_array() -> CliResult<()> {
    section("Concurrent prepend and append");
    let (a, b) = (ReplicaId::from("replica-a"), ReplicaId::from("replica-b"));
    let mut left = Tree::new();
    left.import_json(b"[2, 3, 4]", &a)?;
    let mut right = Tree::load(&left.save()?)?;
    let arr = left.get_node_by_path("/")?.id().clone();

    left.import_json_at(b"0", Some(&arr), "", Some(0), &a)?;
    step("replica-a prepends 0");
    right.import_json_to_array(b"5", &arr, &b)?;
    step("replica-b appends 5");
    show("a", &left);
    show("b", &right);

    left.sync_with(&mut right)?;
    step("sync");
    show("a", &left);
    show("b", &right);
    verdict(left.save()? == right.save()?);
    Ok(())
}

fn demo_last_writer_wins() -> CliResult<()> {
    section("Last writer wins");
    let (a, b) = (ReplicaId::from("replica-a"), ReplicaId::from("replica-b"));
    let mut left = Tree::new();
    left.import_json(b"{}", &a)?;
    let map = left.get_node_by_path("/")?.id().clone();
    left.set_key_value(&map, "key", "value1", &a)?;

    let mut right = Tree::load(&left.save()?)?;
    right.set_key_value(&map, "key", "value2", &b)?;
    right.set_key_value(&map, "key", "value3", &b)?;
    step("replica-b writes value2, then value3");
    left.set_key_value(&map, "key", "value4", &a)?;
    step("replica-a writes value4");

    let report = left.merge(&right)?;
    step(&format!("merge: {}", report));
    show("a", &left);
    Ok(())
}

fn demo_promotion() -> CliResult<()> {
    section("Concurrent documents under the root");
    let mut left = Tree::new();
    let mut right = Tree::load(&left.save()?)?;
    left.import_json(br#"{"name": "B"}"#, &ReplicaId::from("replica-a"))?;
    right.import_json(br#"{"name": "C"}"#, &ReplicaId::from("replica-b"))?;
    show("a", &left);
    show("b", &right);

    let report = left.sync_with(&mut right)?;
    step(&format!("sync promoted {} parent(s)", report.pulled.promotions));
    show("a", &left);
    show("b", &right);
    verdict(left.save()? == right.save()?);
    Ok(())
}

fn demo_tombstones() -> CliResult<()> {
    section("Tombstones and tidy");
    let alice = ReplicaId::from("alice");
    let mut tree = Tree::new();
    tree.import_json(br#"["a", "b", "c"]"#, &alice)?;
    let b = tree.get_node_by_path("/1")?.id().clone();

    tree.mark_deleted(&b, &alice)?;
    step(&format!("mark \"b\" deleted: {} nodes kept", tree.node_count()));
    show("alice", &tree);
    let report = tree.tidy();
    step(&format!(
        "tidy: {} nodes left ({} removed)",
        tree.node_count(),
        report.removed_nodes
    ));
    Ok(())
}

fn demo_paths() -> CliResult<()> {
    section("Path lookups");
    let mut tree = Tree::new();
    tree.import_json(
        br#"{"uid": "u0", "friends": [{"uid": "u1", "friends": []}, {"uid": "u2", "friends": [{"uid": "u3"}]}]}"#,
        &ReplicaId::from("alice"),
    )?;
    for path in ["/friends/1/friends/0/uid", "friends/1", "/friends/9"] {
        match tree.get_value_by_path(path) {
            Ok(value) => step(&format!("{} → {}", path.bright_yellow(), value)),
            Err(err) => step(&format!("{} → {}", path.bright_yellow(), err.to_string().bright_red())),
        }
    }
    Ok(())
}

async fn demo_subscription() -> CliResult<()> {
    section("Subscriptions");
    let alice = Replica::new(ReplicaConfigBuilder::new().replica_id("alice").build());
    alice.import_json(br#"{"todo": []}"#)?;
    let todo = alice.node_at("/todo")?;
    let mut rx = alice.subscribe("/todo")?;

    let first = alice.import_json_at(br#""write docs""#, &todo, "", None)?;
    alice.import_json_at(br#""ship""#, &todo, "", None)?;
    alice.delete(&first)?;
    alice.close();

    while let Some(event) = rx.recv().await {
        let kind = match event.kind {
            NodeEventKind::Added => event.kind.to_string().bright_green(),
            NodeEventKind::MarkedDeleted | NodeEventKind::Removed => {
                event.kind.to_string().bright_red()
            }
            NodeEventKind::Updated => event.kind.to_string().bright_yellow(),
        };
        step(&format!("{:<16} {}", kind, event.path));
    }
    Ok(())
}

async fn run_demo() -> CliResult<()> {
    header("CANOPY - Replicated JSON Tree");
    demo_sibling_insert()?;
    demo_concurrent_array()?;
    demo_last_writer_wins()?;
    demo_promotion()?;
    demo_tombstones()?;
    demo_paths()?;
    demo_subscription().await?;
    Ok(())
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Import {
            input,
            out,
            replica,
        } => run_import(&input, &out, &replica),
        Commands::Export { tree, compact } => run_export(&tree, compact),
        Commands::Get { tree, path } => run_get(&tree, &path),
        Commands::Set {
            tree,
            path,
            value,
            replica,
        } => run_set(&tree, &path, &value, &replica),
        Commands::Merge { local, remote, out } => run_merge(&local, &remote, out.as_deref()),
        Commands::Validate { tree } => run_validate(&tree),
        Commands::Tidy { tree } => run_tidy(&tree),
        Commands::Digest { tree, path } => run_digest(&tree, &path),
        Commands::Demo => run_demo().await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".bright_red().bold(), err);
            ExitCode::FAILURE
        }
    }
}
