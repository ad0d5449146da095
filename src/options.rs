use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::types::Concurrency;

/// Default bind address.
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
/// Default bind port.
pub const DEFAULT_PORT: u16 = 8084;
/// Default ceiling on concurrently live handler threads.
pub const DEFAULT_MAX_THREADS: usize = 100_000;
/// Default read timeout applied while the attach handshake is in flight.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable daemon configuration shared by every dispatch context.
///
/// Built through [`DispatchOptions::new`] and validated by
/// [`DispatchOptionsBuilder::build`]; once built it is only ever read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    hostname: String,
    port: u16,
    concurrency: Concurrency,
    connect: bool,
    hotwire: bool,
    script_path: PathBuf,
    script_args: Vec<OsString>,
    max_threads: usize,
    handshake_timeout: Duration,
}

impl DispatchOptions {
    /// Starts a builder for the given handler program.
    ///
    /// # Defaults
    /// - Hostname: `127.0.0.1`
    /// - Port: `8084`
    /// - Concurrency: fork per connection
    /// - Maximum threads: `100000`
    pub fn new<P: Into<PathBuf>>(script_path: P) -> DispatchOptionsBuilder {
        DispatchOptionsBuilder {
            options: DispatchOptions {
                hostname: DEFAULT_HOSTNAME.to_owned(),
                port: DEFAULT_PORT,
                concurrency: Concurrency::Fork,
                connect: false,
                hotwire: false,
                script_path: script_path.into(),
                script_args: Vec::new(),
                max_threads: DEFAULT_MAX_THREADS,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            },
        }
    }

    // --- Public Getters ---

    pub fn hostname(&self) -> &str { &self.hostname }

    pub fn port(&self) -> u16 { self.port }

    pub fn concurrency(&self) -> Concurrency { self.concurrency }

    /// Returns `true` when the attach handshake runs before dispatch.
    pub fn connect(&self) -> bool { self.connect }

    /// Returns `true` when forked children get the socket as stdin/stdout.
    pub fn hotwire(&self) -> bool { self.hotwire }

    pub fn script_path(&self) -> &Path { &self.script_path }

    /// Extra arguments appended after the socket descriptor.
    pub fn script_args(&self) -> &[OsString] { &self.script_args }

    pub fn max_threads(&self) -> usize { self.max_threads }

    pub fn handshake_timeout(&self) -> Duration { self.handshake_timeout }

    /// Renders the bind endpoint as `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Builder returned by [`DispatchOptions::new`].
#[derive(Debug, Clone)]
pub struct DispatchOptionsBuilder {
    options: DispatchOptions,
}

impl DispatchOptionsBuilder {
    /// Sets the host the daemon binds to.
    pub fn hostname(mut self, hostname: &str) -> Self { self.options.hostname = hostname.to_owned(); self }

    /// Sets the port the daemon binds to.
    pub fn port(mut self, port: u16) -> Self { self.options.port = port; self }

    /// If `true`, handle connections on threads instead of forked processes.
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.options.concurrency = if threaded { Concurrency::Thread } else { Concurrency::Fork };
        self
    }

    /// If `true`, perform the attach handshake before dispatching.
    pub fn connect(mut self, connect: bool) -> Self { self.options.connect = connect; self }

    /// If `true`, plug the socket into the forked child's stdin/stdout.
    pub fn hotwire(mut self, hotwire: bool) -> Self { self.options.hotwire = hotwire; self }

    /// Appends arguments passed verbatim to the handler.
    pub fn script_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.options.script_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the ceiling on concurrently live handler threads.
    pub fn max_threads(mut self, max: usize) -> Self { self.options.max_threads = max; self }

    /// Sets the read timeout used while the handshake is in flight.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self { self.options.handshake_timeout = timeout; self }

    /// Validates the configuration.
    ///
    /// Rejects `hotwire` together with threaded dispatch, an empty script
    /// path, arguments `execv` cannot carry, and a zero thread ceiling.
    pub fn build(self) -> DispatchResult<DispatchOptions> {
        let options = self.options;

        if options.hotwire && options.concurrency == Concurrency::Thread {
            return Err(DispatchError::IncompatibleOptions {
                first: "hotwire",
                second: "threaded",
            });
        }

        if options.script_path.as_os_str().is_empty() {
            return Err(DispatchError::MissingScript);
        }

        if contains_nul(options.script_path.as_os_str()) {
            return Err(DispatchError::InvalidArgument(
                options.script_path.display().to_string(),
            ));
        }
        if let Some(arg) = options.script_args.iter().find(|a| contains_nul(a)) {
            return Err(DispatchError::InvalidArgument(arg.to_string_lossy().into_owned()));
        }

        if options.max_threads == 0 {
            return Err(DispatchError::InvalidThreadLimit);
        }

        Ok(options)
    }
}

fn contains_nul(s: &OsStr) -> bool {
    s.as_bytes().contains(&0)
}

impl fmt::Display for DispatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener on {}", self.concurrency, self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_documented_values() {
        let options = DispatchOptions::new("/bin/echo").build().expect("valid options");
        assert_eq!(options.hostname(), "127.0.0.1");
        assert_eq!(options.port(), 8084);
        assert_eq!(options.concurrency(), Concurrency::Fork);
        assert!(!options.connect());
        assert!(!options.hotwire());
        assert!(options.script_args().is_empty());
        assert_eq!(options.max_threads(), 100_000);
        assert_eq!(options.endpoint(), "127.0.0.1:8084");
    }

    #[test]
    fn hotwire_with_threads_is_rejected() {
        let err = DispatchOptions::new("/bin/echo")
            .threaded(true)
            .hotwire(true)
            .build()
            .expect_err("hotwire and threaded must conflict");
        assert!(matches!(
            err,
            DispatchError::IncompatibleOptions { first: "hotwire", second: "threaded" }
        ));
    }

    #[rstest]
    #[case(false, false)]
    #[case(false, true)]
    #[case(true, false)]
    fn other_mode_combinations_are_accepted(#[case] threaded: bool, #[case] hotwire: bool) {
        let options = DispatchOptions::new("/bin/echo")
            .threaded(threaded)
            .hotwire(hotwire)
            .connect(true)
            .build()
            .expect("valid combination");
        assert_eq!(options.hotwire(), hotwire);
        assert!(options.connect());
    }

    #[test]
    fn empty_script_path_is_rejected() {
        let err = DispatchOptions::new("").build().expect_err("missing script");
        assert!(matches!(err, DispatchError::MissingScript));
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let err = DispatchOptions::new("/bin/echo")
            .script_args(["ok", "bad\0arg"])
            .build()
            .expect_err("nul byte");
        assert!(matches!(err, DispatchError::InvalidArgument(ref a) if a == "bad\0arg"));
    }

    #[test]
    fn zero_thread_ceiling_is_rejected() {
        let err = DispatchOptions::new("/bin/echo")
            .threaded(true)
            .max_threads(0)
            .build()
            .expect_err("zero threads");
        assert!(matches!(err, DispatchError::InvalidThreadLimit));
    }

    #[test]
    fn script_args_keep_their_order() {
        let options = DispatchOptions::new("/usr/local/bin/ivr")
            .script_args(["--lang", "en"])
            .script_args(vec![String::from("-v")])
            .build()
            .expect("valid options");
        assert_eq!(options.script_args(), ["--lang", "en", "-v"]);
    }

    #[test]
    fn script_args_are_not_required_to_be_utf8() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(b"caf\xe9".to_vec());
        let options = DispatchOptions::new("/bin/echo")
            .script_args([raw.clone()])
            .build()
            .expect("valid options");
        assert_eq!(options.script_args(), [raw]);
    }
}
