use clap::Parser;
use git_remote_deb::keyrings;
use std::io::Write as _;

/// Download the Debian keyring packages and install their keyrings for
/// use by git-remote-deb.
#[derive(Parser, Debug)]
#[command(author, version)]
struct Args {
    /// Directory to install keyrings into
    /// [default: ~/.local/share/public-keyrings]
    #[arg(short, long)]
    directory: Option<std::path::PathBuf>,

    /// Enable debug output
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(
            None,
            if args.debug {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
        )
        .init();

    let target = args
        .directory
        .unwrap_or_else(keyrings::default_keyring_dir);
    let installed = keyrings::fetch_keyrings(&target)?;
    log::info!(
        "{} keyring(s) installed under {}",
        installed.len(),
        target.display()
    );
    Ok(())
}
