//! Command-line surface of the `sweepline` binary.

use clap::{Parser, Subcommand, ValueEnum};
use sl_dispatch::{BatchDispatcher, Dispatcher, LocalDispatcher};
use sl_optimizer::{ErrorFileCollector, ResultLedger, SweepLoop};
use sl_types::{GeneralConfig, SlResult};
use std::path::PathBuf;
use tracing::info;

use crate::chain::{Invocation, StageChain};
use crate::config::PipelineConfig;
use crate::prepare::prepare;
use crate::stage::Stage;

#[derive(Debug, Parser)]
#[command(name = "sweepline")]
#[command(about = "Hyperparameter sweeps and post-training stages for interatomic potentials")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "sweepline.yaml")]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Run jobs as local subprocesses instead of submitting them
    #[arg(long, global = true)]
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit the stage chain
    Run {
        /// First stage to submit
        #[arg(long, value_enum, default_value_t = Stage::Search)]
        from: Stage,

        /// Stages to leave out (repeatable)
        #[arg(long, value_enum)]
        skip: Vec<Stage>,

        /// Iteration the search job starts or resumes at
        #[arg(long, default_value_t = 1)]
        start_iteration: u32,
    },

    /// Run the hyperparameter search in this process
    Hyper {
        /// Iteration to start or resume at
        #[arg(long, default_value_t = 1)]
        start_iteration: u32,
    },

    /// Prepare a stage's candidate directories from the previous stage
    Prepare {
        #[arg(long, value_enum)]
        stage: Stage,
    },

    /// Render the result ledger as tables
    Tabulate,
}

/// Stages `run` submits: from `from` onwards, minus `skip`.
pub fn selected_stages(from: Stage, skip: &[Stage]) -> Vec<Stage> {
    Stage::ALL
        .into_iter()
        .filter(|stage| *stage >= from && !skip.contains(stage))
        .collect()
}

fn dispatcher(local: bool, general: &GeneralConfig) -> Box<dyn Dispatcher> {
    if local {
        Box::new(LocalDispatcher::new())
    } else {
        Box::new(BatchDispatcher::slurm().with_poll_interval(general.poll_interval()))
    }
}

pub async fn execute(cli: Cli) -> SlResult<()> {
    let config = PipelineConfig::load(&cli.config)?;
    let config_path = std::fs::canonicalize(&cli.config)?;

    match cli.command {
        Command::Run {
            from,
            skip,
            start_iteration,
        } => {
            let stages = selected_stages(from, &skip);
            // Scheduled jobs run elsewhere and need the absolute config path.
            let invocation = Invocation::new(config.general.executable.clone(), config_path)
                .with_local(cli.local);
            let dispatcher = dispatcher(cli.local, &config.general);
            let mut chain = StageChain::new(config, invocation, dispatcher)
                .with_start_iteration(start_iteration);
            let summary = chain.run(&stages).await?;
            info!(
                stages = summary.stages.len(),
                last = ?summary.last(),
                "chain submitted"
            );
        }
        Command::Hyper { start_iteration } => {
            let dispatcher = dispatcher(cli.local, &config.general);
            let mut sweep: SweepLoop<Box<dyn Dispatcher>> = SweepLoop::new(
                config.general,
                config.hyper_search,
                dispatcher,
                ErrorFileCollector,
            );
            sweep.run(start_iteration).await?;
        }
        Command::Prepare { stage } => {
            prepare(&config, stage)?;
        }
        Command::Tabulate => {
            let names = config.hyper_search.space.names().map(String::from).collect();
            let ledger = ResultLedger::open(config.sweep_path(), names)?;
            for report in ledger.tabulate()? {
                println!("{}", report.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "sweepline",
            "prepare",
            "--stage",
            "inference",
            "--config",
            "/data/ti.yaml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/data/ti.yaml"));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(!cli.local);
        assert!(matches!(cli.command, Command::Prepare { stage: Stage::Inference }));
    }

    #[test]
    fn run_selects_stages_in_chain_order() {
        let cli = Cli::try_parse_from([
            "sweepline", "--local", "run", "--from", "deep", "--skip", "convert",
        ])
        .unwrap();
        assert!(cli.local);
        let Command::Run {
            from,
            skip,
            start_iteration,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(start_iteration, 1);
        assert_eq!(
            selected_stages(from, &skip),
            vec![Stage::Deep, Stage::Inference, Stage::Properties]
        );
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Cli::try_parse_from(["sweepline", "prepare", "--stage", "relax"]).is_err());
    }
}
