use std::path::PathBuf;

use clap::Parser;

// Credentials for a single user, parsed from a NAME:PASSWORD argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub(crate) name: String,
    pub(crate) password: String,
}

fn parse_user(value: &str) -> Result<UserCredential, String> {
    let Some((name, password)) = value.split_once(':') else {
        return Err("expected NAME:PASSWORD (use a trailing colon for an empty password)".into());
    };
    if name.is_empty() {
        return Err("user name must not be empty".into());
    }
    Ok(UserCredential {
        name: name.into(),
        password: password.into(),
    })
}

// CLI configuration for Hatchway.
#[doc(hidden)]
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for SSH connections.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDRESS")]
    pub host: String,

    /// Port to listen for SSH connections.
    #[arg(short, long, default_value_t = 2222, value_name = "PORT")]
    pub port: u16,

    /// Listen on a Unix domain socket instead of a TCP address.
    #[arg(long, value_name = "PATH")]
    pub unix_socket: Option<PathBuf>,

    /// Shell executed when a client requests a pty.
    #[arg(long, default_value = "bash", value_name = "COMMAND")]
    pub shell: String,

    /// User allowed to log in, as NAME:PASSWORD. An empty password lets the
    /// user log in without one. May be repeated.
    #[arg(
        short = 'u',
        long = "user",
        value_name = "NAME:PASSWORD",
        value_parser = parse_user
    )]
    pub users: Vec<UserCredential>,

    /// File path to the server's host key. If missing, it will be created for
    /// you.
    #[arg(long, default_value_os = "./hatchway_host_key", value_name = "FILE")]
    pub host_key_file: PathBuf,

    /// Allow remote port forwarding (tcpip-forward).
    #[arg(long)]
    pub allow_tcpip_forward: bool,

    /// Allow local port forwarding (direct-tcpip).
    #[arg(long)]
    pub allow_direct_tcpip: bool,

    /// Allow command execution and pty allocation.
    #[arg(long)]
    pub allow_execute: bool,

    /// Allow the sftp subsystem.
    #[arg(long)]
    pub allow_sftp: bool,

    /// Allow remote Unix socket forwarding (streamlocal-forward@openssh.com).
    #[arg(long)]
    pub allow_streamlocal_forward: bool,

    /// Allow local Unix socket forwarding (direct-streamlocal@openssh.com).
    #[arg(long)]
    pub allow_direct_streamlocal: bool,
}

// Operations a connection may perform. Absence of a permission means deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Permissions {
    pub(crate) tcpip_forward: bool,
    pub(crate) direct_tcpip: bool,
    pub(crate) execute: bool,
    pub(crate) sftp: bool,
    pub(crate) streamlocal_forward: bool,
    pub(crate) direct_streamlocal: bool,
}

impl ApplicationConfig {
    // With no --allow-* flag everything is allowed; as soon as one is passed,
    // only the named operations are.
    pub(crate) fn permissions(&self) -> Permissions {
        let any_flag = self.allow_tcpip_forward
            || self.allow_direct_tcpip
            || self.allow_execute
            || self.allow_sftp
            || self.allow_streamlocal_forward
            || self.allow_direct_streamlocal;
        if any_flag {
            Permissions {
                tcpip_forward: self.allow_tcpip_forward,
                direct_tcpip: self.allow_direct_tcpip,
                execute: self.allow_execute,
                sftp: self.allow_sftp,
                streamlocal_forward: self.allow_streamlocal_forward,
                direct_streamlocal: self.allow_direct_streamlocal,
            }
        } else {
            Permissions {
                tcpip_forward: true,
                direct_tcpip: true,
                execute: true,
                sftp: true,
                streamlocal_forward: true,
                direct_streamlocal: true,
            }
        }
    }
}
