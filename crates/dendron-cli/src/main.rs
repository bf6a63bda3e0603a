//! # Dendron CLI
//!
//! Command-line interface for the single-neuron STDP simulator.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dendron_sim::{spawn, Command, Controller, Experiment, Status};
use dendron_stimulus::load_patterns;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "dendron")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Single-neuron triplet STDP simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One bounded run, then a summary
    Run {
        /// Run settings (neuron.json)
        settings: PathBuf,
        /// Directory holding <Stimulus>.json and <Stimulus>.txt
        #[arg(short = 'd', long)]
        stimulus_dir: Option<PathBuf>,
        /// Override the sample count
        #[arg(short, long)]
        samples: Option<usize>,
        /// Write the learned model back into the stimulus set
        #[arg(long)]
        save: bool,
    },

    /// Interactive control session (commands on stdin)
    Session {
        /// Run settings (neuron.json)
        settings: PathBuf,
        #[arg(short = 'd', long)]
        stimulus_dir: Option<PathBuf>,
        /// Print every n-th step status
        #[arg(long, default_value_t = 1000)]
        every: usize,
    },

    /// Show the patterns in a pattern file
    Pattern {
        /// Pattern file
        file: PathBuf,
        /// Zeros inserted after every bit
        #[arg(short, long, default_value_t = 0)]
        scale: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            settings,
            stimulus_dir,
            samples,
            save,
        } => run(settings, stimulus_dir, samples, save)?,

        Commands::Session {
            settings,
            stimulus_dir,
            every,
        } => session(settings, stimulus_dir, every).await?,

        Commands::Pattern { file, scale } => {
            let patterns = load_patterns(&file, 0)
                .with_context(|| format!("loading patterns from {}", file.display()))?;
            println!(
                "{} {} ({} patterns)",
                "Patterns:".green().bold(),
                file.display(),
                patterns.len()
            );
            for mut pattern in patterns {
                pattern
                    .expand(scale)
                    .with_context(|| format!("expanding pattern {}", pattern.id()))?;
                println!("  {:>3} {}", pattern.id().to_string().cyan(), pattern.render());
            }
        }
    }

    Ok(())
}

fn load(settings: &Path, stimulus_dir: Option<PathBuf>) -> anyhow::Result<Experiment> {
    log::debug!("Settings file: {}", settings.display());
    Experiment::load(settings, stimulus_dir.as_deref())
        .with_context(|| format!("loading experiment from {}", settings.display()))
}

fn run(
    settings: PathBuf,
    stimulus_dir: Option<PathBuf>,
    samples: Option<usize>,
    save: bool,
) -> anyhow::Result<()> {
    let mut experiment = load(&settings, stimulus_dir)?;
    if let Some(n) = samples {
        experiment.run.duration = n as f64 * experiment.run.time_step / 1_000_000.0;
    }
    let stimulus_path = experiment.stimulus_path.clone();

    let mut controller = Controller::create(experiment)?;
    println!(
        "{} {} synapses, {} samples",
        "Running:".green().bold(),
        controller.simulation().synapse_count(),
        controller.sample_count()
    );

    let bar = ProgressBar::new(controller.sample_count() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("=> "),
    );
    let summary = controller.run_pause_with(|_| bar.inc(1));
    bar.finish_and_clear();

    println!("{}", "Run complete".green().bold());
    println!("  Steps:          {}", summary.steps);
    println!("  Output spikes:  {}", summary.output_spikes.to_string().cyan());
    println!("  Mean weight:    {:.4}", summary.mean_weight);
    println!(
        "  Weight range:   [{:.4}, {:.4}]",
        summary.min_weight, summary.max_weight
    );

    if save {
        let path = stimulus_path.context("experiment has no stimulus file to save into")?;
        controller
            .save_model(&path)
            .with_context(|| format!("saving model to {}", path.display()))?;
        println!("{} {}", "Saved:".green().bold(), path.display());
    }

    Ok(())
}

async fn session(
    settings: PathBuf,
    stimulus_dir: Option<PathBuf>,
    every: usize,
) -> anyhow::Result<()> {
    let experiment = load(&settings, stimulus_dir)?;
    let controller = Controller::create(experiment)?;
    let (mut handle, join) = spawn(controller, 64);
    let every = every.max(1);

    println!(
        "{} ping | start [n] | stop | load | set <target> <field> <value> | quit",
        "Commands:".green().bold()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<Command>() {
                        Ok(command) => {
                            let quit = command == Command::Quit;
                            handle.send(command).await?;
                            if quit {
                                stdin_open = false;
                            }
                        }
                        Err(e) => println!("{}", e.to_string().red()),
                    },
                    None => {
                        stdin_open = false;
                        handle.send(Command::Quit).await?;
                    }
                }
            }
            status = handle.recv() => match status {
                Some(Status::Tick(t)) => {
                    if (t as usize) % every == 0 {
                        println!("{}", Status::Tick(t).to_string().dimmed());
                    }
                }
                Some(Status::Error(msg)) => println!("{}", format!("error: {msg}").red()),
                Some(status) => println!("{}", status.to_string().yellow()),
                None => break,
            },
        }
    }

    let controller = join.await.context("control task panicked")?;
    println!(
        "{} t = {:.1}",
        "Session closed:".green().bold(),
        controller.t()
    );
    Ok(())
}
