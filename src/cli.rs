//! Command-line surface of the `ivrd` binary.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{CommandFactory, Parser};

use crate::error::DispatchResult;
use crate::options::{DEFAULT_HOSTNAME, DEFAULT_MAX_THREADS, DEFAULT_PORT, DispatchOptions};
use crate::telemetry::LogFormat;

const LONG_ABOUT: &str = "\
Start the IVR daemon, listening on <host>:<port>.

Every accepted connection is handed to <script path>, which receives the file \
descriptor of the connected socket as its first argument, followed by the \
<script arguments> given to the daemon.";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "ivrd",
    version,
    about = "Dispatch every accepted TCP connection to a handler program.",
    long_about = LONG_ABOUT,
    override_usage = "ivrd [OPTIONS] <script path> [script arguments...]"
)]
pub struct Cli {
    /// The hostname the daemon should listen to.
    #[arg(short = 'H', long, env = "IVRD_HOSTNAME", default_value = DEFAULT_HOSTNAME)]
    pub hostname: String,

    /// The port the daemon should listen to.
    #[arg(short, long, env = "IVRD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Attach the socket to an event-socket session, issuing 'connect' to
    /// the switch before the handler runs.
    #[arg(long)]
    pub connect: bool,

    /// Use threads instead of forking to handle connections.
    #[arg(long)]
    pub threaded: bool,

    /// Plug the connected socket into the child's STDIN/STDOUT.
    /// Only when not --threaded.
    #[arg(long, conflicts_with = "threaded")]
    pub hotwire: bool,

    /// Ceiling on concurrently running handler threads (--threaded only).
    #[arg(long, env = "IVRD_MAX_THREADS", default_value_t = DEFAULT_MAX_THREADS)]
    pub max_threads: usize,

    /// Log output format.
    #[arg(long, env = "IVRD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Program executed to handle incoming connections.
    #[arg(value_name = "script path")]
    pub script_path: PathBuf,

    /// Additional arguments passed to the script, after the socket descriptor.
    #[arg(
        value_name = "script arguments",
        value_parser = clap::value_parser!(OsString),
        num_args = 0..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub script_args: Vec<OsString>,
}

impl Cli {
    /// Validates the arguments into daemon options.
    pub fn into_options(self) -> DispatchResult<DispatchOptions> {
        DispatchOptions::new(self.script_path)
            .hostname(&self.hostname)
            .port(self.port)
            .connect(self.connect)
            .threaded(self.threaded)
            .hotwire(self.hotwire)
            .max_threads(self.max_threads)
            .script_args(self.script_args)
            .build()
    }
}

/// The one-line usage shown after start-up errors.
pub fn short_usage() -> String {
    Cli::command().render_usage().to_string()
}
