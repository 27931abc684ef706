use clap::Parser;
use miette::Result;
use tracing_subscriber::EnvFilter;

use caliber::cli::{Cli, Commands, GlobalOpts};

fn main() -> Result<()> {
    // Reset SIGPIPE to default behavior (terminate silently) for proper Unix piping.
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .build(),
        )
    }))?;

    let cli = Cli::parse();
    let global = cli.global;
    init_logging(&global);

    match cli.command {
        Commands::Job(cmd) => caliber::cli::commands::job::run(cmd, &global),
        Commands::Standard(cmd) => caliber::cli::commands::standard::run(cmd, &global),
        Commands::Run(args) => caliber::cli::commands::run::run(args, &global),
        Commands::Check(args) => caliber::cli::commands::check::run(args, &global),
        Commands::Lookup(cmd) => caliber::cli::commands::lookup::run(cmd, &global),
        Commands::Dev(cmd) => caliber::cli::commands::dev::run(cmd, &global),
        Commands::Config(cmd) => caliber::cli::commands::config::run(cmd, &global),
        Commands::Completions(args) => caliber::cli::commands::completions::run(args),
    }
}

/// Engine logs go to stderr; `CALIBER_LOG` takes precedence over `-v`/`-q`
fn init_logging(global: &GlobalOpts) {
    let default = if global.verbose {
        "caliber=debug"
    } else if global.quiet {
        "error"
    } else {
        "caliber=warn"
    };
    let filter = EnvFilter::try_from_env("CALIBER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
