use std::num::NonZeroUsize;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

use volrec::{
    Config, Reconstructor,
    config::{RawConfig, ThreadPool},
};

/// Reconstructs a synthetic sphere from a random point cloud
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of points inside the sphere (the same number is placed in a
    /// shell around it)
    #[clap(short, long, default_value_t = 10_000)]
    points: usize,

    /// Sphere radius
    #[clap(short, long, default_value_t = 1.0)]
    radius: f64,

    /// Random seed
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Reconstruction configuration, as a JSON string
    #[clap(short, long)]
    config: Option<String>,

    /// Target spacing for surface subdomains
    #[clap(long)]
    spacing: Option<f64>,

    /// Print the resolved configuration as JSON
    #[clap(long)]
    export: bool,

    /// Number of threads to use
    #[clap(short, long)]
    threads: Option<NonZeroUsize>,

    /// Number of times to reconstruct (for benchmarking)
    #[clap(short = 'N', default_value_t = 1)]
    n: usize,
}

/// Builds points inside a ball (value 1) and in a shell of equal volume
/// around it (value 0)
fn sphere_cloud(n: usize, radius: f64, seed: u64) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let outer = radius * 2f64.cbrt();
    let mut points = Vec::with_capacity(n * 6);
    let mut values = Vec::with_capacity(n * 2);
    for (lo, hi, v) in [(0.0, radius, 1.0), (radius, outer, 0.0)] {
        let mut count = 0;
        while count < n {
            let p: [f64; 3] =
                std::array::from_fn(|_| rng.gen_range(-outer..outer));
            let r = p.iter().map(|v| v * v).sum::<f64>().sqrt();
            if r >= lo && r < hi {
                points.extend(p);
                values.push(v);
                count += 1;
            }
        }
    }
    (points, values)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();

    let raw: RawConfig = match &args.config {
        Some(s) => serde_json::from_str(s).context("could not parse config")?,
        None => serde_json::from_str(
            r#"{"type": "dual_contouring",
                "interpolation": {"type": "from_vector"}}"#,
        )?,
    };
    let cfg: Config = raw.try_into()?;

    let start = Instant::now();
    let (points, values) = sphere_cloud(args.points, args.radius, args.seed);
    info!("Built {} points in {:?}", values.len(), start.elapsed());

    let pool = match args.threads {
        Some(n) if n.get() == 1 => None,
        Some(n) => Some(ThreadPool::Custom(
            rayon::ThreadPoolBuilder::new()
                .num_threads(n.get())
                .build()?,
        )),
        None => Some(ThreadPool::Global),
    };

    info!(
        "Using {} thread(s)",
        pool.as_ref().map_or(1, |p| p.thread_count())
    );

    let mut r = Reconstructor::create(cfg, 3)?;
    r.set_threads(pool.as_ref());
    r.load_points(&points)?;
    r.load_function(&values)?;

    let start = Instant::now();
    for _ in 0..args.n {
        r.evaluate()?;
    }
    info!(
        "Reconstructed {}x at {:?} ms/iteration",
        args.n,
        start.elapsed().as_micros() as f64 / 1000.0 / (args.n as f64)
    );

    let Reconstructor::DualContouring(dc) = &r;
    let mesh = dc.surface()?;
    let expected = 4.0 / 3.0 * std::f64::consts::PI * args.radius.powi(3);
    let volume = r.perform_volume_integration(&values, 1)?[0];
    info!(
        "Surface has {} triangles and {} boundary vertices",
        mesh.triangles.len(),
        mesh.vertices.len()
    );
    info!(
        "Volume {:.4} (expected {expected:.4}), area {:.4}",
        mesh.signed_volume(),
        mesh.area()
    );
    info!("Integrated indicator over the volume: {volume:.4}");

    if let Some(spacing) = args.spacing {
        let (sizes, _) = r.get_surface_subdomains(spacing)?;
        info!(
            "Split {} surface points into {} subdomains",
            sizes.iter().sum::<usize>(),
            sizes.len()
        );
    }
    if args.export {
        let raw = dc.export_configuration();
        println!("{}", serde_json::to_string_pretty(&raw)?);
    }
    Ok(())
}
