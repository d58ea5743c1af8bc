use clap::Parser;

#[derive(Debug, Parser)]
#[clap(version, author, about, long_about = None)]
pub struct CliArgs {
    #[arg(short, long, default_value_t = String::from("/etc/ldapcache.toml"))]
    /// The config file to use
    pub config_file: String,

    /// The directory server url, e.g. ldaps://dc1.example.org. Overrides the configuration.
    #[arg(short, long)]
    pub server: Option<String>,

    /// The DN of the service account used for cache refreshes. Overrides the configuration.
    #[arg(short, long)]
    pub user: Option<String>,

    /// If set, prompt for the service account password instead of reading it from the
    /// configuration.
    #[arg(short, long)]
    pub password: bool,

    /// The search base for users, groups and computers. Overrides the configuration.
    #[arg(short, long)]
    pub base: Option<String>,

    /// Refresh every cache once, print a summary and exit.
    #[arg(long)]
    pub once: bool,
}
