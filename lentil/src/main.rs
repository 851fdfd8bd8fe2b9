use lentil::common::*;
use lentil::run_fit::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Lineage-aware ENdogenous Transcription Inference by Linked kinetics\n\
		  Fits a branching ODE model of unspliced and spliced RNA\n\
		  on a lineage tree of cell types estimated from time and embedding."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit branching RNA kinetics and velocity",
        long_about = "Fit branching RNA kinetics in three stages: \n\
		      (1) Estimate a lineage tree of cell types from kNN transitions\n\
		      (2) Initialize per-type kinetics at steady state\n\
		      (3) Optimize the Gaussian likelihood by minibatch AdamW.\n"
    )]
    Fit(FitArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Fit(args) => args.is_verbose(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .init();

    match &cli.commands {
        Commands::Fit(args) => {
            fit_brode(args)?;
        }
    }

    info!("Done");
    Ok(())
}
