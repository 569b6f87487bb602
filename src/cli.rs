use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fleet-deploy",
    version,
    about = "Installs operating systems and drivers across a fleet over BMC and SSH"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Run this plan headless and exit instead of serving the API.
    #[arg(long)]
    pub plan: Option<PathBuf>,
}
