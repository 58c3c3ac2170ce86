use std::env;
use std::path::PathBuf;

use clap::Parser;

use crate::server::Server;

/// caskdb server cli
#[derive(Parser, Debug)]
#[clap(
    version = "0.1.0",
    about = "Caskdb is a Bitcask-style key-value store served over a line protocol."
)]
pub struct Cli {
    /// Sets logging to "debug" level, defaults to "info"
    #[clap(short, long)]
    pub verbose: bool,

    /// Path of the datastore directory
    #[clap(short = 'd', long = "path", default_value = "datastore")]
    pub path: PathBuf,

    /// Port the server listens on
    #[clap(short, long, default_value_t = 6379)]
    pub port: u16,
}

impl Cli {
    pub fn exec(self) -> anyhow::Result<()> {
        if self.verbose {
            env::set_var("RUST_LOG", "debug")
        } else {
            env::set_var("RUST_LOG", "info")
        }
        env_logger::init();

        let server = Server::new(&self.path, self.port)?;
        server.serve()?;
        Ok(())
    }
}
