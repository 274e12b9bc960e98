// src/main.rs
//
// CLI harness around the lottery_rl engine.
//
// Subcommands:
//   train     train both learners on a history (optionally time-limited)
//   generate  propose tickets for the next draw
//   evaluate  score the frozen learners on a held-out history
//   synth     write a synthetic uniform history as JSON lines
//   status    print the registry summary for one configuration
//
// Results are printed as pretty JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use lottery_rl::history::{load_jsonl, synthetic_history, write_jsonl};
use lottery_rl::{
    DrawRecord, EngineConfig, EngineError, LotteryConfig, Manager, State, Strategy, TrainingBudget,
};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PresetArg {
    Euro,
    Power,
    Mini,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyArg {
    Tabular,
    Approx,
    Ensemble,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Tabular => Strategy::Tabular,
            StrategyArg::Approx => Strategy::FunctionApprox,
            StrategyArg::Ensemble => Strategy::Ensemble,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "lottery_rl",
    about = "Tabular + neural RL learners replayed over lottery draw histories",
    version
)]
struct Cli {
    /// Directory holding saved agents (overrides LOTTERY_RL_MODEL_DIR).
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Base seed (overrides LOTTERY_RL_SEED).
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Verbosity: -v, -vv
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LotteryArgs {
    /// Lottery shape preset.
    #[arg(long, value_enum, default_value_t = PresetArg::Euro)]
    preset: PresetArg,

    /// Custom shape "k1,n1,k2,n2" (overrides --preset).
    #[arg(long)]
    shape: Option<String>,
}

impl LotteryArgs {
    fn resolve(&self) -> anyhow::Result<LotteryConfig> {
        if let Some(raw) = &self.shape {
            let parts: Vec<usize> = raw
                .split(',')
                .map(|p| p.trim().parse::<usize>())
                .collect::<Result<_, _>>()
                .with_context(|| format!("--shape '{}' is not four integers", raw))?;
            if parts.len() != 4 {
                bail!("--shape expects k1,n1,k2,n2, got {} values", parts.len());
            }
            return Ok(LotteryConfig::new(parts[0], parts[1], parts[2], parts[3])?);
        }
        Ok(match self.preset {
            PresetArg::Euro => LotteryConfig::euro_style(),
            PresetArg::Power => LotteryConfig::power_style(),
            PresetArg::Mini => LotteryConfig::mini(),
        })
    }
}

#[derive(Debug, Args)]
struct HistoryArgs {
    /// JSON-lines draw history.
    #[arg(long, conflicts_with = "synthetic")]
    history: Option<PathBuf>,

    /// Use N synthetic draws instead of a file.
    #[arg(long)]
    synthetic: Option<usize>,
}

impl HistoryArgs {
    fn load(&self, lottery: &LotteryConfig, seed: u64) -> anyhow::Result<Vec<DrawRecord>> {
        match (&self.history, self.synthetic) {
            (Some(path), _) => load_jsonl(path, lottery)
                .with_context(|| format!("reading history {}", path.display())),
            (None, Some(n)) => Ok(synthetic_history(lottery, n, seed)),
            (None, None) => bail!("either --history or --synthetic is required"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train both learners and save them.
    Train {
        #[command(flatten)]
        lottery: LotteryArgs,
        #[command(flatten)]
        history: HistoryArgs,
        /// Episodes for the tabular learner.
        #[arg(long, default_value_t = 200)]
        tabular_episodes: u64,
        /// Episodes for the function-approximation learner.
        #[arg(long, default_value_t = 100)]
        approx_episodes: u64,
        /// Cancel the run after this many seconds (partial stats are kept).
        #[arg(long)]
        time_limit_secs: Option<u64>,
    },
    /// Propose tickets for the next draw.
    Generate {
        #[command(flatten)]
        lottery: LotteryArgs,
        #[command(flatten)]
        history: HistoryArgs,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, value_enum, default_value_t = StrategyArg::Ensemble)]
        strategy: StrategyArg,
    },
    /// Score the saved learners on held-out draws.
    Evaluate {
        #[command(flatten)]
        lottery: LotteryArgs,
        #[command(flatten)]
        history: HistoryArgs,
        /// State window for evaluation (defaults to the training window).
        #[arg(long)]
        window: Option<usize>,
    },
    /// Write a synthetic history as JSON lines.
    Synth {
        #[command(flatten)]
        lottery: LotteryArgs,
        #[arg(long, default_value_t = 500)]
        count: usize,
        #[arg(long)]
        out: PathBuf,
    },
    /// Show the saved state of one configuration.
    Status {
        #[command(flatten)]
        lottery: LotteryArgs,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lottery_rl::logging::init(lottery_rl::logging::filter_for_verbosity(cli.verbose, cli.quiet));

    let mut cfg = EngineConfig::from_env();
    if let Some(dir) = &cli.model_dir {
        cfg.model_dir = dir.clone();
    }
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }
    let seed = cfg.seed;
    log::info!(
        "[main] model_dir={} seed={} window={}",
        cfg.model_dir.display(),
        cfg.seed,
        cfg.env.window
    );

    match cli.command {
        Command::Train {
            lottery,
            history,
            tabular_episodes,
            approx_episodes,
            time_limit_secs,
        } => {
            let lottery = lottery.resolve()?;
            let draws = history.load(&lottery, seed)?;
            let budget = TrainingBudget {
                tabular_episodes,
                approx_episodes,
            };
            let manager = Arc::new(Manager::new(cfg));
            let report = match time_limit_secs {
                None => manager.train(&lottery, &draws, budget)?,
                Some(secs) => {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .enable_all()
                        .build()
                        .context("building tokio runtime")?;
                    runtime.block_on(async {
                        let handle = manager.spawn_training(lottery, draws, budget);
                        let token = handle.token();
                        let timer = tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(secs)).await;
                            log::info!("[main] time limit of {}s reached, cancelling", secs);
                            token.cancel();
                        });
                        let result = handle.join().await;
                        timer.abort();
                        result
                    })?
                }
            };
            print_json(&report)?;
        }
        Command::Generate {
            lottery,
            history,
            count,
            strategy,
        } => {
            let lottery = lottery.resolve()?;
            let draws = history.load(&lottery, seed)?;
            let manager = Manager::new(cfg);
            let predictions = match manager.generate(&lottery, &draws, count, strategy.into()) {
                Err(EngineError::DataInsufficient {
                    required,
                    available,
                }) => {
                    log::warn!(
                        "[main] {} of {} draws available, generating from the neutral state",
                        available,
                        required
                    );
                    manager.generate_from_state(&lottery, &State::neutral(), count, strategy.into())?
                }
                other => other?,
            };
            print_json(&predictions)?;
        }
        Command::Evaluate {
            lottery,
            history,
            window,
        } => {
            let lottery = lottery.resolve()?;
            let draws = history.load(&lottery, seed)?;
            let manager = Manager::new(cfg);
            let report = manager.evaluate(&lottery, &draws, window)?;
            print_json(&report)?;
        }
        Command::Synth {
            lottery,
            count,
            out,
        } => {
            let lottery = lottery.resolve()?;
            let draws = synthetic_history(&lottery, count, seed);
            write_jsonl(&out, &draws).with_context(|| format!("writing {}", out.display()))?;
            log::info!("[main] wrote {} draws to {}", draws.len(), out.display());
        }
        Command::Status { lottery } => {
            let lottery = lottery.resolve()?;
            let manager = Manager::new(cfg);
            print_json(&manager.status(&lottery)?)?;
        }
    }
    Ok(())
}
