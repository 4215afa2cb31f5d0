//! # Command-Line Interface Module
//!
//! Argument parsing for the communicator binary, built on clap's derive API.
//! The CLI covers what an operator needs to launch one communicator: the
//! protocol to speak, the service rendezvous socket, the peer identity, an
//! optional configuration file, and logging controls. Individual transport
//! knobs live in the configuration (see [`crate::config`]); `--set` entries
//! override it ad hoc.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;

use crate::communicator::Protocol;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Protocol selector on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    /// UNIX datagram sockets
    Unix,
    /// HTTP long-polling
    Http,
    /// HTTPS long-polling
    Https,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Unix => Protocol::Unix,
            ProtocolArg::Http => Protocol::Http,
            ProtocolArg::Https => Protocol::Https,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Transport protocol this communicator speaks
    #[arg(short = 'p', long, value_enum, default_value_t = ProtocolArg::Unix, help_heading = "Core Options")]
    pub protocol: ProtocolArg,

    /// Path of the transport service's UNIX socket
    ///
    /// The communicator connects here, announces itself with
    /// NEW_COMMUNICATOR, and keeps reconnecting with backoff for as long
    /// as it runs.
    #[arg(short = 'S', long, default_value = crate::defaults::SERVICE_SOCKET, help_heading = "Core Options")]
    pub service_socket: PathBuf,

    /// Peer identity as 64 hex characters
    ///
    /// Identity derivation belongs to the crypto subsystem; accepting it
    /// here keeps this binary runnable stand-alone. A random identity is
    /// generated when omitted.
    #[arg(short = 'i', long, help_heading = "Core Options")]
    pub identity: Option<String>,

    /// Configuration file with [section] / KEY = value entries
    #[arg(short = 'c', long, help_heading = "Core Options")]
    pub config: Option<PathBuf>,

    /// Ad-hoc configuration overrides as section/KEY=value
    ///
    /// Example: --set transport-unix/UNIXPATH=/tmp/my.sock
    #[arg(long = "set", value_name = "SECTION/KEY=VALUE", help_heading = "Core Options")]
    pub overrides: Vec<String>,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and more: trace
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

impl Args {
    /// Apply `--set section/KEY=value` overrides onto a config map.
    pub fn apply_overrides(&self, config: &mut crate::config::Config) -> Result<(), String> {
        for entry in &self.overrides {
            let (path, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("override missing '=': {entry:?}"))?;
            let (section, key) = path
                .split_once('/')
                .ok_or_else(|| format!("override missing section: {entry:?}"))?;
            config.set(section, key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["peer-communicator"]);
        assert_eq!(args.protocol, ProtocolArg::Unix);
        assert_eq!(
            args.service_socket,
            PathBuf::from(crate::defaults::SERVICE_SOCKET)
        );
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn overrides_apply_to_config() {
        let args = Args::parse_from([
            "peer-communicator",
            "--set",
            "transport-unix/UNIXPATH=/tmp/o.sock",
            "--set",
            "nat/DISABLEV6=YES",
        ]);
        let mut config = crate::config::Config::new();
        args.apply_overrides(&mut config).unwrap();
        assert_eq!(config.get("transport-unix", "UNIXPATH"), Some("/tmp/o.sock"));
        assert_eq!(config.get("nat", "DISABLEV6"), Some("YES"));
    }

    #[test]
    fn malformed_override_is_rejected() {
        let args = Args::parse_from(["peer-communicator", "--set", "nonsense"]);
        let mut config = crate::config::Config::new();
        assert!(args.apply_overrides(&mut config).is_err());
    }

    #[test]
    fn protocol_arg_maps_to_protocol() {
        assert_eq!(Protocol::from(ProtocolArg::Https), Protocol::Https);
        let args = Args::parse_from(["peer-communicator", "-p", "http"]);
        assert_eq!(Protocol::from(args.protocol), Protocol::Http);
    }
}
