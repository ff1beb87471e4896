use anyhow::Result;
use structopt::StructOpt;

use minimta::{Opt, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();
    let server = Server::new(opt)?;
    server.start().await
}
