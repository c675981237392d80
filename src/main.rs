//! Quicksilver JIT CLI
//!
//! Drives the tiering core on synthetic input: inline-cache traffic, counter
//! behavior, branch compaction and whole-runtime simulations.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quicksilver_jit::assembler::buffer::CodeBuffer;
use quicksilver_jit::assembler::isa::{Condition, Instruction};
use quicksilver_jit::assembler::link::{JitCompilationEffort, Linker};
use quicksilver_jit::bytecode::{BytecodeBuilder, Slot};
use quicksilver_jit::executable::{CodeOwner, ExecutablePool};
use quicksilver_jit::ic::{AccessKind, AccessObservation, CallSiteId, StructureStubInfo};
use quicksilver_jit::profile::counter::{ExecutionCounter, MemoryPressure};
use quicksilver_jit::structure::{JsObject, StructureTable};
use quicksilver_jit::{JitOptions, JitRuntime, VERSION};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quicksilver-jit")]
#[command(author, version, about = "Adaptive tiered JIT core of the Quicksilver runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JIT options file (JSON); defaults to $QUICKSILVER_JIT_OPTIONS
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed structure ids into one get site and print each cache transition
    Ic {
        /// Comma-separated structure ids, e.g. 1,1,2,3
        #[arg(long, value_delimiter = ',', required = true)]
        shapes: Vec<u32>,
    },

    /// Run an execution counter and report when it trips
    Tier {
        /// Threshold to count towards
        #[arg(long, default_value_t = 1000)]
        threshold: i32,
        /// Memory pressure multiplier
        #[arg(long, default_value_t = 1.0)]
        multiplier: f64,
        /// Number of unit increments to feed
        #[arg(long, default_value_t = 10_000)]
        increments: u32,
    },

    /// Finalize a random branch layout and report its size before and after compaction
    Compact {
        /// Number of branches
        #[arg(long, default_value_t = 64)]
        branches: usize,
        /// Random seed
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Run a synthetic property-reading function through the runtime
    Simulate {
        /// Number of calls
        #[arg(long, default_value_t = 10_000)]
        calls: u32,
        /// Every N-th call passes a differently shaped object (0 = never)
        #[arg(long, default_value_t = 97)]
        mix: u32,
        /// Print stats as JSON
        #[arg(long)]
        json: bool,
        /// Dump the active code block at the end
        #[arg(long)]
        dump: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::debug!(version = VERSION, "starting");

    let options = load_options(cli.config.as_ref())?;
    match cli.command {
        Commands::Ic { shapes } => run_ic(&shapes, &options),
        Commands::Tier { threshold, multiplier, increments } => {
            run_tier(threshold, multiplier, increments, &options)
        }
        Commands::Compact { branches, seed } => run_compact(branches, seed, &options),
        Commands::Simulate { calls, mix, json, dump } => run_simulate(calls, mix, json, dump, options),
    }
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(path: Option<&PathBuf>) -> anyhow::Result<JitOptions> {
    match path {
        Some(path) => JitOptions::from_file(path)
            .with_context(|| format!("failed to load JIT options from '{}'", path.display())),
        None => JitOptions::default()
            .with_env_overrides()
            .context("failed to load JIT options from the environment"),
    }
}

// ==================== ic ====================

fn run_ic(shapes: &[u32], options: &JitOptions) -> anyhow::Result<()> {
    let mut table = StructureTable::new();
    let mut objects: HashMap<u32, Rc<JsObject>> = HashMap::new();
    let mut info = StructureStubInfo::new(CallSiteId(0), AccessKind::GetById, 0, "x".into());

    for (i, &shape) in shapes.iter().enumerate() {
        let object = objects
            .entry(shape)
            .or_insert_with(|| {
                // A distinct leading property gives every id its own structure
                let tag = format!("s{}", shape);
                JsObject::new(table.create_with_properties(None, &[tag.as_str(), "x"]))
            })
            .clone();

        if info.try_get(&object).is_some() {
            println!("{:>4}  shape {:<6} hit    {}", i, shape, info.state().kind());
            continue;
        }
        let observation = AccessObservation::for_get(&object, "x");
        match info.plan(&observation, options) {
            Some(next) => {
                let transition = info.install(next, None, None)?;
                println!(
                    "{:>4}  shape {:<6} miss   {} -> {} ({} cases)",
                    i,
                    shape,
                    transition.from,
                    transition.to,
                    info.state().case_count()
                );
            }
            None => println!("{:>4}  shape {:<6} miss   {}", i, shape, info.state().kind()),
        }
    }
    println!("final: {} after {} hits, {} misses", info.state().kind(), info.hits(), info.misses());
    Ok(())
}

// ==================== tier ====================

fn run_tier(threshold: i32, multiplier: f64, increments: u32, options: &JitOptions) -> anyhow::Result<()> {
    if threshold < 0 || multiplier < 1.0 {
        bail!("threshold must be non-negative and multiplier at least 1");
    }
    let pressure = MemoryPressure::new(multiplier, options.maximum_execution_counts_between_checkpoints);
    let mut counter = ExecutionCounter::new();
    counter.set_new_threshold(threshold, &pressure);

    let mut checkpoints = 0;
    for i in 1..=increments {
        if !counter.tick() {
            continue;
        }
        checkpoints += 1;
        if counter.check_if_threshold_crossed_and_set(&pressure) {
            println!(
                "threshold {} (x{:.2}) crossed after {} increments, {} checkpoints, count {:.0}",
                threshold,
                multiplier,
                i,
                checkpoints,
                counter.count()
            );
            return Ok(());
        }
    }
    println!(
        "threshold {} (x{:.2}) not reached after {} increments, {} checkpoints, count {:.0}",
        threshold,
        multiplier,
        increments,
        checkpoints,
        counter.count()
    );
    Ok(())
}

// ==================== compact ====================

fn random_buffer(branches: usize, rng: &mut StdRng) -> anyhow::Result<CodeBuffer> {
    let mut buffer = CodeBuffer::new();
    let labels: Vec<_> = (0..branches.max(1)).map(|_| buffer.new_label()).collect();
    let mut bound = vec![false; labels.len()];

    for _ in 0..branches {
        for _ in 0..rng.gen_range(0..8) {
            buffer.emit(Instruction::Nop);
        }
        if rng.gen_bool(0.05) {
            // Long stretch that pushes some branches past the short range
            for _ in 0..rng.gen_range(100..400) {
                buffer.emit(Instruction::Nop);
            }
        }
        let target = rng.gen_range(0..labels.len());
        let cond = if rng.gen_bool(0.5) { Condition::Always } else { Condition::NotEqual };
        buffer.branch(cond, labels[target])?;

        let unbound: Vec<usize> = (0..labels.len()).filter(|&i| !bound[i]).collect();
        if !unbound.is_empty() && rng.gen_bool(0.5) {
            let pick = unbound[rng.gen_range(0..unbound.len())];
            buffer.bind(labels[pick]);
            bound[pick] = true;
        }
    }
    for (label, done) in labels.iter().zip(bound) {
        if !done {
            buffer.bind(*label);
        }
    }
    buffer.emit(Instruction::Return);
    Ok(buffer)
}

fn run_compact(branches: usize, seed: u64, options: &JitOptions) -> anyhow::Result<()> {
    let pool = ExecutablePool::new(options);
    let linker = Linker::new(&pool).with_compaction(options.branch_compaction);
    let mut rng = StdRng::seed_from_u64(seed);
    let buffer = random_buffer(branches, &mut rng)?;

    let Some(code) = linker.finalize(buffer, CodeOwner::Thunk, JitCompilationEffort::CanFail)? else {
        bail!("executable memory exhausted");
    };
    let before = code.unlinked_size();
    let after = code.size();
    let saved = before.saturating_sub(after);
    println!(
        "{} branches: {} bytes -> {} bytes ({} saved, {:.1}%)",
        branches,
        before,
        after,
        saved,
        if before == 0 { 0.0 } else { saved as f64 * 100.0 / before as f64 }
    );
    Ok(())
}

// ==================== simulate ====================

fn run_simulate(calls: u32, mix: u32, json: bool, dump: bool, options: JitOptions) -> anyhow::Result<()> {
    let mut runtime = JitRuntime::new(options)?;

    // function sum(o) { return o.x + o.y; }
    let mut b = BytecodeBuilder::new("sum", 1);
    let object = b.param(0);
    let x = b.new_register();
    let y = b.new_register();
    b.get_by_id(x, object, "x");
    b.get_by_id(y, object, "y");
    b.add(x, x, y);
    b.ret(x);
    let sum = runtime.register(b.finish()?);

    let common = Slot::Object(runtime.create_object(&[("x", 1), ("y", 2)]));
    let rare = Slot::Object(runtime.create_object(&[("y", 2), ("x", 1)]));
    for i in 1..=calls {
        let arg = if mix != 0 && i % mix == 0 { &rare } else { &common };
        let completion = runtime.call(sum, std::slice::from_ref(arg))?;
        if completion.is_throw() {
            bail!("call {} threw {:?}", i, completion.value());
        }
    }
    runtime.wait_for_compilations()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runtime.stats())?);
    } else {
        println!("{}", runtime.stats());
    }
    if dump {
        println!("{}", runtime.function(sum)?.active());
    }
    Ok(())
}
