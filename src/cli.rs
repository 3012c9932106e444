//! Define the command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// An SSH certificate authority with browser login.
///
/// Users connect with `ssh -p 2221 <ca>@<host>`, follow the link they are shown and
/// log in with the CA's OpenID Connect provider. The session then prints a short-lived
/// certificate for the key they connected with.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the service's configuration file.
    ///
    /// Relative paths inside the file, such as CA private keys and the SSH host key,
    /// are resolved against the directory the file is in.
    #[arg(
        long,
        short,
        env = "SSHCA_CONFIG",
        default_value = "/etc/ssh-casign-sso/config.toml"
    )]
    pub config: PathBuf,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "SSHCA_LOG", default_value = "WARN,ssh_casign_sso=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the SSH and web front-ends.
    Listen {},

    /// Validate the configuration, load every CA key and list the authorities.
    CheckConfig {},
}
