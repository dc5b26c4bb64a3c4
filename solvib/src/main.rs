use clap::{Parser, Subcommand};
use log::info;
use solvib::fit_interaction::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "SOLVIB",
    long_about = "Solute-solvent interaction prediction with a variational\n\
		  information bottleneck over the atoms of both molecules.\n\
		  Molecular graphs are read from JSON lines files."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train an interaction model",
        long_about = "Train the model in two passes per minibatch:\n\
		      (1) a plain pass on the interacted atom features\n\
		      (2) a bottleneck pass on compressed noisy atoms\n\
		      and keep the parameters of the best validation epoch.\n"
    )]
    Train(TrainArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            if args.verbose() {
                std::env::set_var("RUST_LOG", "info");
            }
            env_logger::init();
            fit_interaction_model(args)?;
        }
    }

    info!("Done");
    Ok(())
}
