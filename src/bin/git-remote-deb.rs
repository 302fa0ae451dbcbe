use clap::Parser;
use git_remote_deb::{helper, RunContext};
use std::io::Write as _;

/// git remote helper for deb:: URLs: imports the full snapshot.debian.org
/// history of a source package. Invoked by git, not directly.
#[derive(Parser, Debug)]
#[command(author, version)]
struct Args {
    /// Name of the remote as configured in git
    remote: String,

    /// Remote address: deb::<package>[?skip=...&trust=...&email=...]
    url: String,

    /// Enable debug output
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // The logger itself passes everything; the effective level is the
    // global maximum, which the `option verbosity` command adjusts at
    // runtime.
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(None, log::LevelFilter::Debug)
        .init();
    log::set_max_level(if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    let mut ctx = RunContext::new(&args.remote, &args.url)?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    helper::serve(&mut ctx, stdin.lock(), &mut stdout)?;
    Ok(())
}
