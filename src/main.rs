mod config;
mod distributed;
mod evaluation;
mod logging;
mod mcmc;
mod model;
mod optim;
mod orchestrator;
mod params;
mod scheduler;
mod stats;
mod wavefunction;

use anyhow::Result;
use clap::Parser;

use config::VmcConfig;
use distributed::{create_collective, CollectiveBackend, DeviceMesh};
use evaluation::evaluate_wavefunctions;
use orchestrator::Orchestrator;
use params::param_count;
use scheduler::SchedulingMethod;
use wavefunction::init_wavefunctions;

/// varmc: shared variational Monte Carlo optimization across molecular
/// geometries
#[derive(Parser, Debug)]
#[command(name = "varmc")]
#[command(about = "Shared-parameter VMC optimization", long_about = None)]
struct Args {
    /// Path to the configuration YAML file
    #[arg(short = 'f', long = "config", default_value = "configs/h2.yaml")]
    config_file: String,

    /// Override per-target optimization epochs from the YAML config
    #[arg(long = "n-epochs")]
    n_epochs: Option<usize>,

    /// Override evaluation epochs from the YAML config
    #[arg(long = "n-eval-epochs")]
    n_eval_epochs: Option<usize>,

    /// Override the number of compute devices
    #[arg(long = "devices")]
    devices: Option<usize>,

    /// Collective backend: "single" or "cpu"
    #[arg(long = "collective-backend")]
    collective_backend: Option<String>,

    /// Override the scheduling method: "round_robin" or "stddev"
    #[arg(long = "scheduling-method")]
    scheduling_method: Option<String>,

    /// Override the MCMC seed
    #[arg(long = "seed")]
    seed: Option<u64>,

    /// Headless mode: output only JSON metrics (no progress bar)
    #[arg(long)]
    headless: bool,

    /// Override the run directory
    #[arg(long = "run-dir")]
    run_dir: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let headless = args.headless;
    if !headless {
        println!("=== varmc: shared VMC optimization ===");
        println!("Loading configuration from: {}", args.config_file);
    }
    let mut config = VmcConfig::from_yaml(&args.config_file)?;

    // Apply CLI overrides
    if let Some(n_epochs) = args.n_epochs {
        if !headless {
            println!(
                "CLI override: n_epochs = {} (was {})",
                n_epochs, config.optimization.n_epochs
            );
        }
        config.optimization.n_epochs = n_epochs;
    }
    if let Some(n_eval) = args.n_eval_epochs {
        if !headless {
            println!(
                "CLI override: evaluation n_epochs = {} (was {})",
                n_eval, config.evaluation.n_epochs
            );
        }
        config.evaluation.n_epochs = n_eval;
    }
    if let Some(devices) = args.devices {
        if !headless {
            println!(
                "CLI override: device_count = {} (was {})",
                devices, config.devices.device_count
            );
        }
        config.devices.device_count = devices;
    }
    if let Some(ref backend) = args.collective_backend {
        let parsed: CollectiveBackend = backend
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        config.devices.backend = parsed;
    }
    if let Some(ref method) = args.scheduling_method {
        let parsed: SchedulingMethod = method
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        if !headless {
            println!(
                "CLI override: scheduling_method = {} (was {})",
                parsed, config.optimization.shared.scheduling_method
            );
        }
        config.optimization.shared.scheduling_method = parsed;
    }
    if let Some(seed) = args.seed {
        config.mcmc.seed = seed;
    }
    if let Some(ref run_dir) = args.run_dir {
        config.output.run_dir = Some(run_dir.clone());
    }
    // Overrides may have invalidated cross-field constraints.
    config.validate()?;

    // Run directory: explicit > env (wrapper scripts) > timestamped
    let run_dir = match config.output.run_dir.clone() {
        Some(dir) => dir,
        None => match std::env::var("VARMC_RUN_DIR") {
            Ok(dir) => dir,
            Err(_) => {
                let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                format!("./runs/{}", timestamp)
            }
        },
    };
    std::fs::create_dir_all(&run_dir)?;
    config.save(format!("{}/full_config.yml", run_dir))?;
    if !headless {
        println!("Run directory: {}\n", run_dir);
    }

    // Device mesh and collective are resolved once for the whole run.
    let mesh = DeviceMesh::new(&config.devices)?;
    let collective = create_collective(&config.devices)?;
    if !headless {
        println!(
            "Using {} device(s), root: {:?}",
            mesh.device_count(),
            mesh.root_device()
        );
    }

    // Build every target and the canonical shared parameter set.
    let run = init_wavefunctions(&config, &mesh, Some(std::path::Path::new(&run_dir)))?;
    let n_targets = run.wavefunctions.len();
    let n_shared = param_count(&run.shared_params);
    let n_unique = param_count(&run.wavefunctions[0].unique_params);

    if !headless {
        println!("\n============================================================");
        println!("SHARED OPTIMIZATION");
        println!("============================================================\n");
        println!("  Targets: {}", n_targets);
        for wf in &run.wavefunctions {
            println!(
                "    {} ({} ions, {} electrons, E_ref: {:?})",
                wf.physical.name,
                wf.physical.ion_positions.len(),
                wf.physical.n_electrons,
                wf.physical.e_ref
            );
        }
        println!(
            "  Params: {} shared + {} unique per target",
            n_shared, n_unique
        );
        println!(
            "  Scheduler: {} (max_age {})",
            config.optimization.shared.scheduling_method, config.optimization.shared.max_age
        );
        println!(
            "  Walkers: {} opt / {} eval on {} device(s)",
            config.mcmc.n_walkers_opt,
            config.mcmc.n_walkers_eval,
            mesh.device_count()
        );
        println!(
            "  Epochs: {} per target = {} total\n",
            config.optimization.n_epochs,
            config.optimization.n_epochs * n_targets
        );
    }

    // Optimization
    let mut wavefunctions = run.wavefunctions;
    let mut shared_params = run.shared_params;
    if config.optimization.n_epochs > 0 {
        if !headless {
            println!("Starting optimization...");
        }
        let orchestrator = Orchestrator::new(
            &config,
            &mesh,
            collective.as_ref(),
            &run.model,
            &run.partition,
            headless,
        );
        let (wfs, shared, _optimizer) =
            orchestrator.optimize_shared(wavefunctions, shared_params, None)?;
        wavefunctions = wfs;
        shared_params = shared;
    }
    for wf in &wavefunctions {
        wf.save_checkpoint(&shared_params, "final")?;
    }

    // Evaluation
    let summary = if config.evaluation.n_epochs > 0 {
        if !headless {
            println!("\nStarting evaluation...");
        }
        let summary = evaluate_wavefunctions(
            &config,
            &mesh,
            &run.model,
            &mut wavefunctions,
            &shared_params,
        )?;
        for eval in &summary.per_target {
            if headless {
                println!(
                    "{}",
                    serde_json::json!({
                        "target": eval.name,
                        "e_mean": eval.e_mean,
                        "e_mean_sigma": eval.e_mean_sigma,
                        "error_mha": eval.error_mha,
                    })
                );
            } else {
                match (eval.error_mha, eval.sigma_error_mha) {
                    (Some(error), Some(sigma)) => println!(
                        "  {}: E = {:.6} ± {:.6} Ha (error {:+.2} ± {:.2} mHa)",
                        eval.name, eval.e_mean, eval.e_mean_sigma, error, sigma
                    ),
                    _ => println!(
                        "  {}: E = {:.6} ± {:.6} Ha",
                        eval.name, eval.e_mean, eval.e_mean_sigma
                    ),
                }
            }
        }
        if let (Some(error), Some(sigma)) = (summary.error_eval, summary.sigma_error_eval) {
            if !headless {
                println!(
                    "\n  Aggregate: error {:+.2} ± {:.2} mHa over {} target(s)",
                    error,
                    sigma,
                    summary.per_target.len()
                );
            }
        }
        Some(summary)
    } else {
        None
    };

    for wf in &wavefunctions {
        wf.logger.on_run_end();
    }

    // Run metadata alongside the per-target logs
    let run_json = serde_json::json!({
        "run_dir": run_dir,
        "experiment_name": config.experiment_name,
        "n_targets": n_targets,
        "n_params_shared": n_shared,
        "n_params_unique": n_unique,
        "n_epochs": config.optimization.n_epochs,
        "scheduling_method": config.optimization.shared.scheduling_method.to_string(),
        "device_count": mesh.device_count(),
        "error_eval_mha": summary.as_ref().and_then(|s| s.error_eval),
        "sigma_error_eval_mha": summary.as_ref().and_then(|s| s.sigma_error_eval),
        "error_plus_2_stdev_mha": summary.as_ref().and_then(|s| s.error_plus_2_stdev),
    });
    if let Ok(text) = serde_json::to_string_pretty(&run_json) {
        let _ = std::fs::write(format!("{}/run.json", run_dir), text);
    }

    if !headless {
        println!("\nDone. Logs and checkpoints in: {}", run_dir);
    }
    Ok(())
}
