use std::time::Instant;

use clap::{Parser, ValueEnum};
use cusparse_solver::core::{GaussianFactorGraph, GraphResult, JacobianFactor, Ordering};
use cusparse_solver::init_logger_with_level;
use cusparse_solver::linalg::{
    ComputeDevice, CuSparseSolver, CuSparseSolverConfig, CudaDevice, FactorizationType, HostDevice,
};
use nalgebra::{DMatrix, DVector};
use tracing::{Level, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// Host-memory device (always available)
    Host,
    /// First CUDA GPU (needs the `cuda` feature and the CUDA libraries)
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Cholesky,
    Qr,
}

#[derive(Parser, Debug)]
#[command(name = "solve_chain")]
#[command(about = "Solve a linear chain of block variables with the sparse Cholesky backend")]
struct Args {
    /// Number of variables in the chain
    #[arg(short, long, default_value = "100")]
    length: usize,

    /// Block size of every variable
    #[arg(short, long, default_value = "3")]
    dim: usize,

    /// Compute device
    #[arg(long, value_enum, default_value = "host")]
    device: DeviceKind,

    /// Factorization to request
    #[arg(long, value_enum, default_value = "cholesky")]
    mode: Mode,

    /// Pivot tolerance of the Cholesky primitive
    #[arg(short, long, default_value = "1e-5")]
    tolerance: f64,

    /// Eliminate variables from the end of the chain
    #[arg(long)]
    reverse: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prior on x0 followed by odometry-like factors `x_i - x_{i-1} = d_i`
fn chain_graph(length: usize, dim: usize) -> GraphResult<GaussianFactorGraph> {
    let mut graph = GaussianFactorGraph::new();
    if length == 0 {
        return Ok(graph);
    }
    let identity = DMatrix::<f64>::identity(dim, dim);
    graph.push(JacobianFactor::unary(0, identity.clone(), DVector::zeros(dim))?);

    for i in 1..length {
        let step = DVector::from_fn(dim, |r, _| ((i + r) as f64 * 0.7).sin());
        let between = JacobianFactor::binary(
            (i - 1) as u64,
            -identity.clone(),
            i as u64,
            identity.clone(),
            step,
        )?;
        graph.push(between);
    }
    Ok(graph)
}

fn run<D: ComputeDevice>(device: D, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let graph = chain_graph(args.length, args.dim)?;
    let natural = Ordering::natural(&graph);
    let ordering = if args.reverse {
        natural.reversed()
    } else {
        natural
    };

    let factorization = match args.mode {
        Mode::Cholesky => FactorizationType::Cholesky,
        Mode::Qr => FactorizationType::Qr,
    };
    let config = CuSparseSolverConfig::default()
        .with_factorization(factorization)
        .with_tolerance(args.tolerance);
    let solver = CuSparseSolver::with_config(device, ordering, config);

    info!(
        "Solving chain: {} variables of size {} ({} factors, {} rows) on {}",
        args.length,
        args.dim,
        graph.len(),
        graph.rows(),
        solver.device().name()
    );

    let start = Instant::now();
    let values = solver.solve(&graph)?;
    let elapsed = start.elapsed();

    info!("Solved {} variables in {:?}", values.len(), elapsed);
    info!("Residual norm: {:.3e}", (2.0 * graph.error(&values)?).sqrt());
    if let Some(last) = args.length.checked_sub(1).and_then(|k| values.get(k as u64)) {
        info!("x{} = {:?}", args.length - 1, last.as_slice());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger_with_level(if args.verbose { Level::DEBUG } else { Level::INFO });

    let result = match args.device {
        DeviceKind::Host => run(HostDevice::new(), &args),
        DeviceKind::Cuda => run(CudaDevice::default(), &args),
    };
    if let Err(e) = &result {
        error!("Solve failed: {}", e);
    }
    result
}
