//! snapsend - Incremental btrfs snapshot replication.
//!
//! Exit codes: 0 success, 1 one or more transfers failed, 2 invalid
//! arguments or unparseable lock journal, 3 snapshot creation failed.

use clap::Parser;
use snapsend::cli::{self, Args};
use snapsend::coordinator::{Coordinator, Policy};
use snapsend::endpoint::{parse_destination, Destination, LocalSource};
use snapsend::pipeline::RunGuard;
use snapsend::utils::logger;
use snapsend::BackupError;

const EXIT_OK: i32 = 0;
const EXIT_TRANSFER_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_SNAPSHOT_FAILED: i32 = 3;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let argv = match cli::expand_arg_files(std::env::args()) {
        Ok(argv) => argv,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let args = match Args::try_parse_from(argv) {
        Ok(args) => args,
        // clap renders help/version and usage errors itself; its exit
        // code matches the documented contract (2 on bad usage)
        Err(e) => e.exit(),
    };
    if let Err(e) = args.validate() {
        eprintln!("{}", e);
        return EXIT_USAGE;
    }
    if let Err(e) = logger::init(args.effective_verbosity()) {
        eprintln!("failed to initialize logging: {}", e);
        return EXIT_TRANSFER_FAILED;
    }

    tracing::info!("snapsend v{} starting", env!("CARGO_PKG_VERSION"));

    let opts = args.endpoint_options();
    let source = match LocalSource::new(&args.source, &args.snapshot_folder, opts.clone()) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("{}", e);
            return EXIT_TRANSFER_FAILED;
        }
    };

    let mut destinations: Vec<Box<dyn Destination>> = Vec::new();
    for spec in &args.destinations {
        match parse_destination(spec, &opts) {
            Ok(dest) => destinations.push(dest),
            Err(e) => {
                tracing::error!("{}", e);
                return EXIT_USAGE;
            }
        }
    }

    let guard = match RunGuard::install() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!("failed to install signal handler: {}", e);
            return EXIT_TRANSFER_FAILED;
        }
    };

    let policy = Policy {
        create_snapshot: !args.no_snapshot,
        do_transfer: !args.no_transfer,
        retain_source: args.num_snapshots,
        retain_destination: args.num_backups,
        locked_dests_only: args.locked_dests,
        remove_locks: args.remove_locks,
        progress: args.progress_enabled(),
    };

    match Coordinator::new(Box::new(source), destinations, policy, opts, guard).run() {
        Ok(report) => {
            if report.success() {
                tracing::info!(
                    "backup complete: snapshot {}, {} transferred, {} cleaned up",
                    report.created_snapshot.as_deref().unwrap_or("skipped"),
                    report.transferred,
                    report.cleaned
                );
                EXIT_OK
            } else {
                tracing::error!("backup finished with {} failure(s)", report.failures);
                EXIT_TRANSFER_FAILED
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
            match e {
                BackupError::InvalidArguments(_)
                | BackupError::InvalidDestination(_)
                | BackupError::CorruptJournal(_) => EXIT_USAGE,
                BackupError::SnapshotExists(_) | BackupError::SnapshotFailed(_) => {
                    EXIT_SNAPSHOT_FAILED
                }
                _ => EXIT_TRANSFER_FAILED,
            }
        }
    }
}
