pub mod toml_config;

pub use toml_config::RunConfig;

#[cfg(feature = "cli")]
use clap::Parser;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "dhis2-recon")]
#[command(about = "Reconcile and validate DHIS2 datasets across instances")]
pub struct CliConfig {
    #[arg(long, short = 'c', default_value = "recon.toml")]
    pub config: String,

    #[arg(long, help = "Override [run] period (e.g. 202401)")]
    pub period: Option<String>,

    #[arg(long, value_delimiter = ',', help = "Override [run] org_units")]
    pub org_units: Option<Vec<String>>,

    #[arg(long, help = "Override [output] path")]
    pub output: Option<String>,

    #[arg(long, help = "Print the run plan without contacting any DHIS2 instance")]
    pub dry_run: bool,

    #[arg(long, help = "Never publish to the destination dataset")]
    pub no_publish: bool,

    #[arg(long, short = 'v', help = "Enable verbose output")]
    pub verbose: bool,
}
