use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use periphlink::{
    cli::{
        config::Config,
        flash,
        list_ports,
        monitor,
        print_blocks,
        run_command,
        ConnectArgs,
        FlashArgs,
        RunArgs,
    },
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info", env = "PERIPHLINK_LOG")]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the attached serial ports matching the device profile
    ListPorts,
    /// List the blocks the device understands
    Blocks,
    /// Run a single block command and print its result
    Run(RunArgs),
    /// Upload the device firmware
    Flash(FlashArgs),
    /// Print telemetry sent by the device until interrupted
    Monitor(ConnectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(cli.log_level);
    debug!("{:#?}", cli.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match cli.subcommand {
        Commands::ListPorts => list_ports(&config),
        Commands::Blocks => print_blocks(&config),
        Commands::Run(args) => run_command(args, &config),
        Commands::Flash(args) => flash(args, &config),
        Commands::Monitor(args) => monitor(args, &config),
    }
}
