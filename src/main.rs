use modforge::{AbsPath, Orchestrator, Result};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let exe = std::env::args().next().unwrap_or_else(|| "modforge".to_string());
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.len() != 3 {
        eprintln!("usage: {exe} <modules_dir> <module_name> <artifacts_dir>");
        std::process::exit(1);
    }

    if let Err(err) = run(&args[0], &args[1], &args[2]) {
        eprintln!("{exe}: {err}");
        std::process::exit(1);
    }
}

fn run(modules_dir: &str, module_name: &str, artifacts_dir: &str) -> Result<()> {
    let modules_dir = AbsPath::absolutize(modules_dir)?;
    let artifacts_dir = AbsPath::absolutize(artifacts_dir)?;
    Orchestrator::new(modules_dir, module_name, artifacts_dir).run()
}
