use clap::Parser;
use gridhalo::exchange::{
    dims_create, ChannelConfig, Device, ExchangeEngine, FieldSet, LocalTransport, LocalUniverse,
    ProcessTopology, Protocol, Transport, VariableSelection,
};
use gridhalo::pattern::GlobalPattern;
use gridhalo::{ExchangeStats, Field4, HaloError, SubdomainLayout};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Halo exchange driver: decomposes a global grid over in-process ranks,
/// exchanges ghost cells and checks every ghost against the global pattern.
#[derive(Parser, Debug)]
#[command(name = "gridhalo", version)]
struct Cli {
    /// Number of ranks (one thread each)
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Process grid, e.g. 2,2,1 (default: balanced split of --ranks)
    #[arg(long, value_delimiter = ',')]
    procs: Option<Vec<usize>>,

    /// Global interior cells per axis
    #[arg(long, value_delimiter = ',', default_value = "64,64,64")]
    global: Vec<usize>,

    /// Active dimensions (1-3)
    #[arg(long, default_value_t = 3)]
    dims: usize,

    /// Ghost cells per side on every active axis
    #[arg(long, default_value_t = 2)]
    ghost: usize,

    /// Cell-centered variables in the field (all are exchanged)
    #[arg(long, default_value_t = 5)]
    nvar: usize,

    /// Also exchange face-centered components
    #[arg(long)]
    staggered: bool,

    /// Wire protocol
    #[arg(long, value_enum, default_value_t = Protocol::Persistent)]
    protocol: Protocol,

    /// Exchange rounds (all axes per round)
    #[arg(long, default_value_t = 10)]
    rounds: usize,

    /// Axes (1-3) that are NOT periodic
    #[arg(long, value_delimiter = ',')]
    open: Vec<usize>,

    /// Rayon threads per rank for pack/unpack (0 = serial)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Seconds a rank waits for a message before giving up
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Print exchange stats to stderr
    #[arg(long)]
    stats: bool,
}

struct RankReport {
    rank: usize,
    mismatches: usize,
    stats: ExchangeStats,
}

fn padded(values: &[usize], dims: usize, fill: usize) -> [usize; 3] {
    let mut out = [fill; 3];
    for (d, slot) in out.iter_mut().enumerate().take(dims) {
        *slot = values.get(d).copied().unwrap_or(fill);
    }
    out
}

fn process_grid(cli: &Cli) -> gridhalo::Result<[usize; 3]> {
    match &cli.procs {
        Some(p) => {
            let grid = padded(p, 3, 1);
            if grid.iter().product::<usize>() != cli.ranks {
                return Err(HaloError::Config(format!(
                    "process grid {grid:?} does not hold {} ranks",
                    cli.ranks
                )));
            }
            Ok(grid)
        }
        None => dims_create(cli.ranks, cli.dims),
    }
}

fn run_rank(
    cli: &Cli,
    transport: LocalTransport,
    grid: [usize; 3],
    periodic: [bool; 3],
) -> gridhalo::Result<RankReport> {
    let rank = transport.rank();
    let _span = tracing::info_span!("rank", rank).entered();
    let global = padded(&cli.global, cli.dims, 1);

    let topology = ProcessTopology::cartesian(rank, grid, periodic)?;
    let (layout, start) = SubdomainLayout::decompose(cli.dims, cli.ghost, global, &topology)?;
    let device = if cli.threads > 0 {
        Device::rayon(cli.threads)?
    } else {
        Device::serial()
    };
    let transport = Arc::new(transport);
    let mut engine = ExchangeEngine::new(Arc::clone(&transport), topology)?.with_device(device);

    let variables = VariableSelection::all(cli.nvar, cli.staggered)?;
    let config = ChannelConfig::new(layout, variables.clone()).with_protocol(cli.protocol);
    let mut channel = engine.create_channel(&config)?;

    let pattern = GlobalPattern::new(layout, start, global, periodic);
    let mut cell = Field4::cell_centered(&layout, cli.nvar);
    let mut faces = Field4::staggered(&layout);
    pattern.init_cells(&mut cell);
    pattern.init_faces(&mut faces);

    for _ in 0..cli.rounds {
        let mut fields = FieldSet {
            cell: &mut cell,
            staggered: cli.staggered.then_some(&mut faces),
        };
        channel.exchange_all(&mut fields)?;
    }

    let mut mismatches = pattern.check_cells(&cell, variables.indices()).len();
    if cli.staggered {
        mismatches += pattern.check_faces(&faces).len();
    }
    if mismatches > 0 {
        tracing::warn!(mismatches, "ghost cells disagree with the global pattern");
    }

    let stats = channel.stats().clone();
    tracing::debug!(device = engine.device().name(), launches = engine.device().launches(), "kernels");
    transport.barrier()?;
    channel.destroy()?;
    Ok(RankReport {
        rank,
        mismatches,
        stats,
    })
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let grid = process_grid(&cli).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    let mut periodic = [true; 3];
    for &axis in &cli.open {
        if !(1..=3).contains(&axis) {
            eprintln!("Error: --open takes axes 1, 2 or 3, got {}", axis);
            std::process::exit(1);
        }
        periodic[axis - 1] = false;
    }

    let started = Instant::now();
    let universe = LocalUniverse::with_timeout(cli.ranks, Duration::from_secs(cli.timeout));
    let results: Vec<gridhalo::Result<RankReport>> = std::thread::scope(|s| {
        let handles: Vec<_> = universe
            .into_iter()
            .map(|transport| {
                let cli = &cli;
                s.spawn(move || run_rank(cli, transport, grid, periodic))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(HaloError::Transport("rank thread panicked".into())))
            })
            .collect()
    });

    let mut total = ExchangeStats::default();
    let mut mismatches = 0;
    for result in results {
        let report = result.unwrap_or_else(|e| {
            eprintln!("Exchange error: {}", e);
            std::process::exit(1);
        });
        if report.mismatches > 0 {
            eprintln!("rank {}: {} ghost entries wrong", report.rank, report.mismatches);
        }
        mismatches += report.mismatches;
        total.merge(&report.stats);
    }

    println!(
        "{} ranks {:?}, {} rounds, protocol {}: {} in {:.3}s",
        cli.ranks,
        grid,
        cli.rounds,
        cli.protocol,
        if mismatches == 0 { "all ghosts correct" } else { "GHOST MISMATCH" },
        started.elapsed().as_secs_f64()
    );

    if cli.stats {
        total.display("gridhalo exchange stats");
    }
    if mismatches > 0 {
        std::process::exit(1);
    }
}
