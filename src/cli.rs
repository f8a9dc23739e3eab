use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "A single-torrent BitTorrent leech client")]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: String,

    /// Verbose per-event logging instead of the progress display
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Directory to place the downloaded file(s) in
    #[arg(short = 'o', long = "output", default_value = ".")]
    pub output: String,
}
