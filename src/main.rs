//! subvolsync CLI
//!
//! Wires the planner, the three `Store` backends, and the transfer engine
//! together behind three entry points:
//!
//! - `subvolsync sync <source> <dest>` — compute and run an incremental sync.
//! - `subvolsync list <store>` — print volumes (or raw content lines) a
//!   store holds.
//! - `subvolsync --server --mode <r|a|w> <path>` — the far end of an
//!   `ssh://` store, spawned by another instance of this binary over ssh.

use std::io::Write;
use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};
use subvolsync::peer::server::PeerServer;
use subvolsync::progress::ProgressReporter;
use subvolsync::store::local::LocalStore;
use subvolsync::store::s3::S3Store;
use subvolsync::store::ssh::SshStore;
use subvolsync::{config::SyncOptions, planner, Mode, ShowProgress, Store, StoreUri};

#[derive(Parser)]
#[command(name = "subvolsync", version, about = "Synchronize btrfs snapshots across local, S3, and SSH-tunneled stores")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize snapshots from `source` to `dest`.
    Sync {
        source: String,
        dest: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        delete: bool,
        #[arg(long)]
        measure: bool,
        #[arg(long, default_value_t = subvolsync::transfer::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },
    /// List the volumes (and, with `--contents`, raw content lines) a store
    /// holds.
    List {
        store: String,
        #[arg(long)]
        contents: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Always,
    Never,
}

impl From<ProgressArg> for ShowProgress {
    fn from(p: ProgressArg) -> ShowProgress {
        match p {
            ProgressArg::Auto => ShowProgress::Auto,
            ProgressArg::Always => ShowProgress::Always,
            ProgressArg::Never => ShowProgress::Never,
        }
    }
}

fn main() {
    subvolsync::logging::init();

    // `--server` is sniffed ahead of clap: the ssh peer protocol invokes
    // this binary as `subvolsync --server --mode <r|a|w> <path>`, a shape
    // that clap's derive can't cleanly mix with the `sync`/`list`
    // subcommands (a bare positional and an optional subcommand are
    // ambiguous to the same parser). Every other invocation goes through
    // `Cli::parse` as usual.
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let result = if raw.first().map(String::as_str) == Some("--server") {
        run_server(&raw[1..])
    } else {
        let cli = Cli::parse();
        match cli.command {
            Some(Command::Sync { source, dest, dry_run, delete, measure, chunk_size, progress }) => {
                run_sync(&source, &dest, dry_run, delete, measure, chunk_size, progress.into())
            }
            Some(Command::List { store, contents }) => run_list(&store, contents),
            None => {
                eprintln!("no subcommand given; run with --help");
                std::process::exit(2);
            }
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Parses `--mode <r|a|w> <path>` (the args following `--server`) and runs
/// the peer server against a `LocalStore` rooted at `<path>`.
fn run_server(args: &[String]) -> anyhow::Result<()> {
    let mode_flag_pos = args.iter().position(|a| a == "--mode").ok_or_else(|| anyhow::anyhow!("--server requires --mode"))?;
    let mode_str = args.get(mode_flag_pos + 1).ok_or_else(|| anyhow::anyhow!("--mode requires a value"))?;
    let mode = Mode::parse(mode_str).ok_or_else(|| anyhow::anyhow!("invalid --mode value: {mode_str}"))?;
    let path = args
        .iter()
        .enumerate()
        .find(|&(i, _)| i != mode_flag_pos && i != mode_flag_pos + 1)
        .map(|(_, a)| a.clone())
        .ok_or_else(|| anyhow::anyhow!("--server requires a path"))?;

    let store: Box<dyn Store> = Box::new(LocalStore::new(path, mode, false, ShowProgress::Never));
    let mut server = PeerServer::new(store, mode);
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    let code = server.run(stdin, stdout)?;
    std::process::exit(code);
}

fn run_list(store_uri: &str, contents: bool) -> anyhow::Result<()> {
    let uri = StoreUri::parse(store_uri)?;
    let (mut store, _filter) = open_store(&uri, Mode::Read, false, ShowProgress::Never)?;
    store.open().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if contents {
        for line in store.list_contents().map_err(|e| anyhow::anyhow!(e.to_string()))? {
            println!("{line}");
        }
    } else {
        for vol in store.list_volumes().map_err(|e| anyhow::anyhow!(e.to_string()))? {
            println!("{vol}");
        }
    }

    store.close().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}

fn run_sync(
    source_uri: &str,
    dest_uri: &str,
    dry_run: bool,
    delete: bool,
    measure: bool,
    chunk_size: usize,
    show_progress: ShowProgress,
) -> anyhow::Result<()> {
    let opts = SyncOptions {
        dry_run,
        chunk_size,
        show_progress,
        delete,
        measure,
    };

    let source = StoreUri::parse(source_uri)?;
    let dest = StoreUri::parse(dest_uri)?;

    let (mut source_store, source_filter) = open_store(&source, Mode::Read, opts.dry_run, opts.show_progress)?;
    let dest_mode = if opts.delete { Mode::Write } else { Mode::Append };
    let (mut dest_store, _dest_filter) = open_store(&dest, dest_mode, opts.dry_run, opts.show_progress)?;

    source_store.open().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    dest_store.open().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let required = required_volumes(source_store.as_ref(), source_filter.as_deref())?;
    if required.is_empty() {
        tracing::info!("nothing to synchronize: no volumes matched");
        return Ok(());
    }

    let mut stores: Vec<Box<dyn Store>> = vec![source_store, dest_store];
    let plan = if opts.measure {
        // `--measure` forces every estimated diff to be measured exactly,
        // even when no store reports itself remote (plan_with_measurement
        // otherwise only measures when `Store::is_remote` is true).
        let mut forced = planner::plan(&required, &stores, true, opts.delete)?;
        for diff in forced.diffs.iter_mut() {
            if diff.size_is_estimated {
                if let Some(store) = stores.get(diff.sink) {
                    let _ = store.measure_size(diff, opts.chunk_size);
                }
            }
        }
        forced
    } else {
        planner::plan_with_measurement(&required, &stores, opts.chunk_size, opts.delete)?
    };
    let dest_index = stores.len() - 1;

    for kept in &plan.kept {
        tracing::info!("already present: {kept}");
        stores[dest_index].keep(kept).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    for diff in &plan.diffs {
        tracing::info!("sending {diff}");
        let paths = stores[diff.sink].get_paths(diff.to).unwrap_or_default();
        let mut reporter = ProgressReporter::new(Some(diff.size), Some(diff.to_string()), opts.show_progress);

        let Some(mut reader) = stores[diff.sink].send(diff).map_err(|e| anyhow::anyhow!(e.to_string()))? else {
            continue;
        };
        let Some(mut writer) = stores[dest_index].receive(diff, &paths).map_err(|e| anyhow::anyhow!(e.to_string()))? else {
            continue;
        };
        let mut skip = stores[dest_index].chunk_skip();
        let sent = subvolsync::transfer::pump(&mut reader, &mut writer, opts.chunk_size, Some(&mut reporter), skip.as_deref_mut())?;
        drop(skip);
        drop(writer);

        // Records the now-exact size in a known-sizes sidecar, so a later
        // run (or an S3 destination's next `open`) doesn't need to measure
        // this edge again.
        let mut known = subvolsync::KnownSizes::new();
        known.record(diff.to, diff.from, sent);
        if let Some(mut sidecar) = stores[dest_index].receive_volume_info(&paths).map_err(|e| anyhow::anyhow!(e.to_string()))? {
            sidecar.write_all(known.to_sidecar().as_bytes())?;
        }
    }

    if opts.delete {
        stores[dest_index].delete_unused(opts.dry_run).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        stores[dest_index].delete_partials(opts.dry_run).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    for store in &mut stores {
        store.close().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }
    Ok(())
}

/// Every volume a directory-style store holds, or the single volume whose
/// path basename matches `filter` for a single-snapshot source.
fn required_volumes(store: &dyn Store, filter: Option<&str>) -> anyhow::Result<Vec<uuid::Uuid>> {
    let volumes = store.list_volumes().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let Some(filter) = filter else {
        return Ok(volumes.into_iter().map(|v| v.uuid).collect());
    };
    let mut out = Vec::new();
    for vol in volumes {
        let paths = store.get_paths(vol.uuid).unwrap_or_default();
        if paths.iter().any(|p| Path::new(p).file_name().map(|n| n == filter.as_ref()).unwrap_or(false)) {
            out.push(vol.uuid);
        }
    }
    Ok(out)
}

/// Opens the backend named by `uri`. Returns the store plus, for a
/// single-snapshot (non-directory) locator, the basename to filter
/// `required_volumes` down to.
fn open_store(
    uri: &StoreUri,
    mode: Mode,
    dry_run: bool,
    show_progress: ShowProgress,
) -> anyhow::Result<(Box<dyn Store>, Option<String>)> {
    match uri {
        StoreUri::Local { path, directory } => {
            let (root, filter) = split_root_and_filter(path, *directory);
            Ok((Box::new(LocalStore::new(root, mode, dry_run, show_progress)), filter))
        }
        StoreUri::S3 { bucket, prefix, directory } => {
            let (root, filter) = split_root_and_filter(prefix, *directory);
            let store = S3Store::new(bucket.clone(), root, mode, dry_run, show_progress)?;
            Ok((Box::new(store), filter))
        }
        StoreUri::Ssh { user, host, path, directory } => {
            let (root, filter) = split_root_and_filter(path, *directory);
            let store = SshStore::new(user.clone(), host.clone(), root, mode, dry_run, show_progress);
            Ok((Box::new(store), filter))
        }
    }
}

fn split_root_and_filter(path: &str, directory: bool) -> (String, Option<String>) {
    if directory {
        return (path.to_string(), None);
    }
    let p = Path::new(path);
    let root = p.parent().map(|x| x.to_string_lossy().into_owned()).unwrap_or_default();
    let leaf = p.file_name().map(|x| x.to_string_lossy().into_owned());
    (root, leaf)
}
