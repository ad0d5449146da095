//! Handler invocation: handshake, argument marshalling, control transfer.

use std::ffi::{CStr, CString, OsStr};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::handshake::{Attach, Session};
use crate::sys::unix;
use crate::types::ConnectionContext;

/// Argument vector handed to the handler:
/// `[handler path, socket descriptor, extra arguments...]`.
///
/// Built fresh per connection.
#[derive(Debug)]
pub struct HandlerArgs {
    args: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl HandlerArgs {
    pub fn build<S: AsRef<OsStr>>(path: &Path, socket: RawFd, extra: &[S]) -> DispatchResult<Self> {
        let mut args = Vec::with_capacity(2 + extra.len());
        args.push(to_cstring(path.as_os_str())?);
        args.push(to_cstring(OsStr::new(&socket.to_string()))?);
        for arg in extra {
            args.push(to_cstring(arg.as_ref())?);
        }

        let mut ptrs: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Ok(HandlerArgs { args, ptrs })
    }

    /// The vector for `conn`, from the handler path and arguments it was
    /// configured with.
    pub fn for_connection(conn: &ConnectionContext) -> DispatchResult<Self> {
        let options = conn.options();
        Self::build(options.script_path(), conn.socket_fd(), options.script_args())
    }

    /// Number of arguments, not counting the terminating null.
    pub fn len(&self) -> usize { self.args.len() }

    pub fn is_empty(&self) -> bool { self.args.is_empty() }

    pub fn get(&self, index: usize) -> Option<&CStr> {
        self.args.get(index).map(CString::as_c_str)
    }

    pub fn program(&self) -> &CStr { &self.args[0] }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.args.iter().map(CString::as_c_str)
    }

    /// Null-terminated pointer array for `execv`.
    pub(crate) fn as_ptrs(&self) -> &[*const c_char] { &self.ptrs }
}

fn to_cstring(s: &OsStr) -> DispatchResult<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| DispatchError::InvalidArgument(s.to_string_lossy().into_owned()))
}

/// Transfers control to the handler program.
pub trait Launcher: Send + Sync {
    /// Runs the handler with `args`, letting it inherit `socket`.
    ///
    /// Returns the handler's exit status where the launcher waits for it.
    fn launch(&self, args: &HandlerArgs, socket: RawFd) -> DispatchResult<ExitStatus>;
}

/// Replaces the current process image with the handler.
///
/// Only usable in a forked child: on success it never returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceImage;

impl Launcher for ReplaceImage {
    fn launch(&self, args: &HandlerArgs, socket: RawFd) -> DispatchResult<ExitStatus> {
        let path = Path::new(OsStr::from_bytes(args.program().to_bytes()));
        unix::clear_cloexec(socket).map_err(|source| DispatchError::Exec {
            path: path.to_path_buf(),
            source,
        })?;
        unix::reset_sigpipe();
        let source = unix::execv(args.program(), args.as_ptrs());
        Err(DispatchError::Exec { path: path.to_path_buf(), source })
    }
}

/// Starts the handler as a subprocess and waits for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnAndWait;

impl Launcher for SpawnAndWait {
    fn launch(&self, args: &HandlerArgs, socket: RawFd) -> DispatchResult<ExitStatus> {
        let path = Path::new(OsStr::from_bytes(args.program().to_bytes()));
        let mut command = Command::new(path);
        command.args(args.iter().skip(1).map(|a| OsStr::from_bytes(a.to_bytes())));
        // Runs in the child between fork and exec; fcntl is async-signal-safe.
        unsafe {
            command.pre_exec(move || unix::clear_cloexec(socket));
        }

        let spawn_err = |source| DispatchError::Spawn { path: path.to_path_buf(), source };
        let mut child = command.spawn().map_err(spawn_err)?;
        child.wait().map_err(spawn_err)
    }
}

/// Runs one connection through handshake, marshalling and launch.
pub struct HandlerInvoker<L> {
    attach: Option<Arc<dyn Attach>>,
    launcher: L,
}

impl<L: Launcher> HandlerInvoker<L> {
    pub fn new(attach: Option<Arc<dyn Attach>>, launcher: L) -> Self {
        HandlerInvoker { attach, launcher }
    }

    /// Hands `conn` to the handler.
    ///
    /// A failed handshake closes the socket. The attached session is torn
    /// down on every path before this returns.
    pub fn invoke(&self, conn: ConnectionContext) -> DispatchResult<ExitStatus> {
        let args = HandlerArgs::for_connection(&conn)?;
        self.invoke_with(conn, &args)
    }

    /// Like [`invoke`](Self::invoke), with an argument vector marshalled
    /// beforehand. Fork dispatch builds it in the parent so the child does
    /// not have to.
    pub fn invoke_with(&self, conn: ConnectionContext, args: &HandlerArgs) -> DispatchResult<ExitStatus> {
        let session = match &self.attach {
            Some(attach) => match attach.attach(&conn.stream, conn.peer) {
                Ok(session) => Some(session),
                Err(source) => {
                    let peer = conn.peer;
                    drop(conn);
                    return Err(DispatchError::Handshake { peer, source });
                }
            },
            None => None,
        };

        let result = self.launcher.launch(args, conn.socket_fd());
        if let Some(session) = session {
            Session::disconnect(session);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeError;
    use crate::options::DispatchOptions;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Mutex;
    use rstest::rstest;

    #[rstest]
    #[case(&[])]
    #[case(&["--verbose"])]
    #[case(&["a", "-b", "c d"])]
    fn args_are_path_fd_then_extras(#[case] extra: &[&str]) {
        let args = HandlerArgs::build(Path::new("/bin/echo"), 11, extra).expect("marshal");
        assert_eq!(args.len(), 2 + extra.len());
        assert_eq!(args.get(0).expect("argv0").to_str(), Ok("/bin/echo"));
        assert_eq!(args.get(1).expect("argv1").to_str(), Ok("11"));
        for (i, want) in extra.iter().enumerate() {
            assert_eq!(args.get(i + 2).expect("extra").to_str(), Ok(*want));
        }
        let ptrs = args.as_ptrs();
        assert_eq!(ptrs.len(), args.len() + 1);
        assert!(ptrs[args.len()].is_null());
    }

    #[test]
    fn non_utf8_arguments_keep_their_bytes() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let extra = [OsString::from_vec(b"a\xffb".to_vec())];
        let args = HandlerArgs::build(Path::new("/bin/echo"), 4, &extra).expect("marshal");
        assert_eq!(args.get(2).expect("extra").to_bytes(), b"a\xffb");
    }

    #[test]
    fn nul_bytes_fail_marshalling() {
        let err = HandlerArgs::build(Path::new("/bin/echo"), 3, &["x\0y"]).expect_err("nul");
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    /// Records what it was asked to launch instead of running anything.
    #[derive(Default)]
    struct RecordingLauncher {
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, args: &HandlerArgs, _socket: RawFd) -> DispatchResult<ExitStatus> {
            let argv = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
            self.seen.lock().expect("lock").push(argv);
            Ok(ExitStatus::from_raw(0))
        }
    }

    impl Launcher for &RecordingLauncher {
        fn launch(&self, args: &HandlerArgs, socket: RawFd) -> DispatchResult<ExitStatus> {
            (**self).launch(args, socket)
        }
    }

    struct RefusingAttach;

    impl Attach for RefusingAttach {
        fn attach(&self, _: &TcpStream, _: SocketAddr) -> Result<Session, HandshakeError> {
            Err(HandshakeError::NoChannelData)
        }
    }

    struct AcceptingAttach;

    impl Attach for AcceptingAttach {
        fn attach(&self, stream: &TcpStream, _: SocketAddr) -> Result<Session, HandshakeError> {
            Ok(Session::new(stream.try_clone()?, vec![("Unique-ID".into(), "abc".into())]))
        }
    }

    fn connection(options: DispatchOptions) -> (ConnectionContext, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (stream, peer) = listener.accept().expect("accept");
        (ConnectionContext::new(stream, peer, Arc::new(options)), client)
    }

    #[test]
    fn invoke_passes_the_socket_descriptor() {
        let options = DispatchOptions::new("/opt/ivr/handler")
            .script_args(["--lang", "en"])
            .build()
            .expect("options");
        let (conn, _client) = connection(options);
        let fd = conn.socket_fd();

        let launcher = RecordingLauncher::default();
        let invoker = HandlerInvoker::new(None, &launcher);
        let status = invoker.invoke(conn).expect("invoke");
        assert!(status.success());

        let seen = launcher.seen.lock().expect("lock");
        assert_eq!(
            *seen,
            vec![vec!["/opt/ivr/handler".to_owned(), fd.to_string(), "--lang".into(), "en".into()]]
        );
    }

    #[test]
    fn invoke_with_launches_the_vector_it_is_given() {
        let options = DispatchOptions::new("/opt/ivr/handler").build().expect("options");
        let (conn, _client) = connection(options);
        let args = HandlerArgs::build(Path::new("/opt/ivr/other"), 99, &["x"]).expect("marshal");

        let launcher = RecordingLauncher::default();
        let invoker = HandlerInvoker::new(None, &launcher);
        invoker.invoke_with(conn, &args).expect("invoke");

        let seen = launcher.seen.lock().expect("lock");
        assert_eq!(*seen, vec![vec!["/opt/ivr/other".to_owned(), "99".into(), "x".into()]]);
    }

    #[test]
    fn failed_handshake_closes_the_socket_without_launching() {
        let options = DispatchOptions::new("/bin/true").connect(true).build().expect("options");
        let (conn, mut client) = connection(options);

        let launcher = RecordingLauncher::default();
        let invoker = HandlerInvoker::new(Some(Arc::new(RefusingAttach)), &launcher);
        let err = invoker.invoke(conn).expect_err("handshake must fail");
        assert!(matches!(err, DispatchError::Handshake { .. }));
        assert!(launcher.seen.lock().expect("lock").is_empty());

        let mut buf = [0u8; 1];
        let n = std::io::Read::read(&mut client, &mut buf).expect("read eof");
        assert_eq!(n, 0, "peer should observe the close");
    }

    #[test]
    fn successful_handshake_launches_once() {
        let options = DispatchOptions::new("/bin/true").connect(true).build().expect("options");
        let (conn, _client) = connection(options);

        let launcher = RecordingLauncher::default();
        let invoker = HandlerInvoker::new(Some(Arc::new(AcceptingAttach)), &launcher);
        invoker.invoke(conn).expect("invoke");
        assert_eq!(launcher.seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn spawn_and_wait_reports_the_exit_status() {
        let options = DispatchOptions::new("/bin/sh")
            .threaded(true)
            .build()
            .expect("options");
        let (conn, _client) = connection(options);
        // `sh <fd>` tries to run a script named after the descriptor.
        let invoker = HandlerInvoker::new(None, SpawnAndWait);
        let status = invoker.invoke(conn).expect("spawned");
        assert!(!status.success());
    }

    #[test]
    fn spawn_and_wait_fails_for_missing_programs() {
        let options = DispatchOptions::new("/nonexistent/handler").build().expect("options");
        let (conn, _client) = connection(options);
        let invoker = HandlerInvoker::new(None, SpawnAndWait);
        let err = invoker.invoke(conn).expect_err("missing program");
        assert!(matches!(err, DispatchError::Spawn { .. }));
    }
}
