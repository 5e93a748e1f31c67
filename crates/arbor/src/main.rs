use arbor_core::Jobspec;
use arbor_graph::ClusterShape;
use arbor_scheduler::{
    policy_by_name, DfuTraverser, MatchOp, MatchResult, MatcherData, SchedulerError,
    TraverserConfig, DEFAULT_DURATION,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "arbor", about = "Arbor graph-based resource matcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Demo inventory generated for a session
#[derive(Args)]
struct ShapeArgs {
    /// Number of racks
    #[arg(long, default_value_t = 1)]
    racks: u64,
    /// Nodes per rack
    #[arg(long, default_value_t = 2)]
    nodes: u64,
    /// Sockets per node
    #[arg(long, default_value_t = 2)]
    sockets: u64,
    /// Cores per socket
    #[arg(long, default_value_t = 4)]
    cores: u64,
    /// Memory units per socket (0 for none)
    #[arg(long, default_value_t = 16)]
    memory: u64,
    /// Add a power subsystem (node → pdu → panel)
    #[arg(long)]
    power: bool,
    /// Length of the scheduling horizon in seconds
    #[arg(long, default_value_t = 1_000_000)]
    horizon: u64,
}

impl ShapeArgs {
    fn shape(&self) -> ClusterShape {
        ClusterShape {
            racks: self.racks,
            nodes_per_rack: self.nodes,
            sockets_per_node: self.sockets,
            cores_per_socket: self.cores,
            memory_per_socket: self.memory,
            power: self.power,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Match a jobspec against a generated inventory
    Match {
        /// Path to the jobspec YAML document
        #[arg(long)]
        jobspec: PathBuf,
        /// Match policy
        #[arg(long, env = "ARBOR_POLICY", default_value = "high")]
        policy: String,
        /// Match operation
        #[arg(long, default_value = "allocate")]
        op: String,
        /// Id of the first job
        #[arg(long, default_value_t = 1)]
        jobid: u64,
        /// Requested start time
        #[arg(long, default_value_t = 0)]
        at: i64,
        /// Number of times to match the jobspec, with consecutive job ids
        #[arg(long, default_value_t = 1)]
        repeat: u64,
        /// Duration of jobspecs that do not set one
        #[arg(long, env = "ARBOR_DEFAULT_DURATION", default_value_t = DEFAULT_DURATION)]
        default_duration: u64,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        shape: ShapeArgs,
    },
    /// Print the generated inventory
    Shape {
        #[command(flatten)]
        shape: ShapeArgs,
    },
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Match {
            jobspec,
            policy,
            op,
            jobid,
            at,
            repeat,
            default_duration,
            json,
            shape,
        } => {
            let request = MatchRequest {
                jobspec,
                policy,
                op: op.parse()?,
                jobid,
                at,
                repeat,
                config: TraverserConfig {
                    default_duration,
                    ..TraverserConfig::default()
                },
                json,
            };
            run_match(&request, &shape)
        }
        Commands::Shape { shape } => run_shape(&shape),
    }
}

struct MatchRequest {
    jobspec: PathBuf,
    policy: String,
    op: MatchOp,
    jobid: u64,
    at: i64,
    repeat: u64,
    config: TraverserConfig,
    json: bool,
}

/// Match the jobspec `repeat` times against a fresh inventory
fn run_match(request: &MatchRequest, shape: &ShapeArgs) -> miette::Result<()> {
    let mut jobspec = Jobspec::from_file(&request.jobspec)?;
    let mut graph = shape.shape().build(0, shape.horizon)?;

    let mut data = MatcherData::containment(request.policy.as_str());
    if shape.power {
        data = data.with_power();
    }
    let policy = policy_by_name(&request.policy, data)?;
    info!(
        "Matching {} with policy {} ({})",
        request.jobspec.display(),
        policy.name(),
        request.op
    );

    let mut traverser = DfuTraverser::new(&mut graph, policy.as_ref(), request.config.clone())?;
    traverser.initialize()?;

    for jobid in request.jobid..request.jobid.saturating_add(request.repeat) {
        match traverser.run(&mut jobspec, request.op, jobid, request.at) {
            Ok(result) => print_result(&result, request.json)?,
            Err(e @ (SchedulerError::Infeasible { .. } | SchedulerError::NoFeasibleTime { .. })) => {
                warn!("{}", e);
                println!("jobid={} status=FAILED", jobid);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn print_result(result: &MatchResult, json: bool) -> miette::Result<()> {
    if json {
        println!("{}", arbor_core::to_json_pretty(result)?);
        return Ok(());
    }
    for line in &result.trace {
        println!("{}", line);
    }
    println!(
        "jobid={} status={} at={} duration={}",
        result.jobid, result.status, result.at, result.duration
    );
    Ok(())
}

fn run_shape(shape: &ShapeArgs) -> miette::Result<()> {
    let graph = shape.shape().build(0, shape.horizon)?;
    println!(
        "{} vertices, {} edges",
        graph.vertex_count(),
        graph.edge_count()
    );
    for subsystem in graph.subsystems() {
        println!("subsystem {}", subsystem);
    }
    for (resource_type, total) in graph.type_totals() {
        println!("{:>10} {}", resource_type, total);
    }
    Ok(())
}
