//! stepvm CLI: run machines, log single steps, verify step logs.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use stepvm_machine::{FlashConfig, Machine, MachineConfig, RunStatus};
use stepvm_merkle::MerkleTree;
use stepvm_replay::{step, verify_step, AccessLog, LogType};

/// stepvm: deterministic RISC-V emulator with verifiable single-step
/// execution
#[derive(Parser)]
#[command(name = "stepvm")]
#[command(version = "0.1.0")]
#[command(about = "Run RISC-V machines and produce/verify step logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a machine until it halts, yields, or hits the cycle bound
    Run {
        /// Path to the boot image copied to the start of RAM
        #[arg(long, value_name = "PATH")]
        boot_image: PathBuf,

        /// RAM size in MiB
        #[arg(long, value_name = "MIB", default_value = "64")]
        memory_size: u64,

        /// Kernel command line
        #[arg(long, value_name = "STRING", default_value = "")]
        cmdline: String,

        /// Flash drive as PATH@START (repeatable); append :shared to
        /// persist target writes in the backing file
        #[arg(long, value_name = "PATH@START[:shared]")]
        flash: Vec<String>,

        /// Stop once mcycle reaches this bound
        #[arg(long, value_name = "NUM", default_value_t = u64::MAX)]
        max_mcycle: u64,
    },

    /// Execute one logged step and write the access log
    Step {
        /// Path to the boot image copied to the start of RAM
        #[arg(long, value_name = "PATH")]
        boot_image: PathBuf,

        /// RAM size in MiB
        #[arg(long, value_name = "MIB", default_value = "64")]
        memory_size: u64,

        /// Run this many cycles before the logged step
        #[arg(long, value_name = "NUM", default_value = "0")]
        warmup_mcycle: u64,

        /// Output path for the JSON access log
        #[arg(long, value_name = "PATH", default_value = "step.json")]
        output: PathBuf,

        /// Record the log without Merkle proofs
        #[arg(long)]
        no_proofs: bool,
    },

    /// Verify a step log produced by `step`
    Verify {
        /// Path to the JSON access log
        #[arg(long, value_name = "PATH")]
        log: PathBuf,
    },
}

fn parse_flash(spec: &str) -> anyhow::Result<FlashConfig> {
    let (spec, shared) = match spec.strip_suffix(":shared") {
        Some(rest) => (rest, true),
        None => (spec, false),
    };
    let (path, start) = spec
        .rsplit_once('@')
        .context("flash spec must be PATH@START")?;
    let start = parse_u64(start)?;
    let backing = PathBuf::from(path);
    let length = fs::metadata(&backing)
        .with_context(|| format!("could not stat {}", backing.display()))?
        .len();
    let label = backing
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flash".to_owned());
    Ok(FlashConfig {
        start,
        length,
        backing,
        label,
        shared,
    })
}

fn parse_u64(s: &str) -> anyhow::Result<u64> {
    let val = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(val)
}

fn build_machine(
    boot_image: &PathBuf,
    memory_size_mib: u64,
    cmdline: String,
    flash_specs: &[String],
) -> anyhow::Result<Machine> {
    let boot_image = fs::read(boot_image)
        .with_context(|| format!("could not read boot image {}", boot_image.display()))?;
    let flash = flash_specs
        .iter()
        .map(|s| parse_flash(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let config = MachineConfig {
        ram_size: memory_size_mib << 20,
        boot_image,
        cmdline,
        flash,
        htif_iyield: 0,
    };
    Ok(Machine::new(config)?)
}

fn hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Commands::Run {
            boot_image,
            memory_size,
            cmdline,
            flash,
            max_mcycle,
        } => {
            let mut machine = build_machine(&boot_image, memory_size, cmdline, &flash)?;
            let status = machine.run(max_mcycle);
            let mcycle = machine.state.mcycle;
            match status {
                RunStatus::Halted => tracing::info!(mcycle, "machine halted"),
                RunStatus::Yielded => tracing::info!(mcycle, "machine yielded"),
                RunStatus::CycleLimit => tracing::info!(mcycle, "cycle bound reached"),
            }
        }

        Commands::Step {
            boot_image,
            memory_size,
            warmup_mcycle,
            output,
            no_proofs,
        } => {
            let mut machine = build_machine(&boot_image, memory_size, String::new(), &[])?;
            if warmup_mcycle > 0 {
                machine.run(warmup_mcycle);
            }
            let mut tree = MerkleTree::new();
            let log_type = LogType {
                proofs: !no_proofs,
                annotations: true,
            };
            let log = step(&mut machine, &mut tree, log_type)?;
            println!("before root: {}", hex(&log.before_root));
            println!("after root:  {}", hex(&log.after_root));
            println!("accesses:    {}", log.len());
            fs::write(&output, serde_json::to_vec_pretty(&log)?)
                .with_context(|| format!("could not write {}", output.display()))?;
            tracing::info!(path = %output.display(), "access log written");
        }

        Commands::Verify { log } => {
            let bytes =
                fs::read(&log).with_context(|| format!("could not read {}", log.display()))?;
            let log: AccessLog = serde_json::from_slice(&bytes)?;
            let verify_proofs = log.log_type.proofs;
            match verify_step(&log, log.before_root, verify_proofs) {
                Ok(root) => {
                    println!("verified: final root {}", hex(&root));
                }
                Err(err) => {
                    bail!("verification failed: {err}");
                }
            }
        }
    }
    Ok(())
}
