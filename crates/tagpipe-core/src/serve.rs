use crate::secret::{self, AuthError};
use crate::session::{self, SessionError, TagHandler};
use std::env;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

// Invocation-path suffix the host uses to deploy one-shot filter plugins.
pub const FILTER_SUFFIX: &str = ".filter.dpi";

// Resolved once at startup and passed down; never read from an ambient
// location after that.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub key_path: PathBuf,
}

impl RuntimeConfig {
    pub fn from_home() -> Result<Self, AuthError> {
        Ok(Self {
            key_path: secret::default_key_path()?,
        })
    }

    pub fn with_key_path(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[derive(Debug)]
pub enum RunError {
    Listener(io::Error),
    Session(SessionError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener(err) => write!(f, "accept failed: {err}"),
            Self::Session(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Listener(err) => Some(err),
            Self::Session(err) => Some(err),
        }
    }
}

/// Accepts connections forever, one session thread per connection. A failed
/// session only ends that connection; a failed accept ends the server.
pub fn serve<H>(listener: UnixListener, config: RuntimeConfig, handler: H) -> Result<(), RunError>
where
    H: TagHandler + 'static,
{
    let handler: Arc<dyn TagHandler> = Arc::new(handler);
    let config = Arc::new(config);
    loop {
        let (stream, _addr) = listener.accept().map_err(RunError::Listener)?;
        let handler = Arc::clone(&handler);
        let config = Arc::clone(&config);
        thread::spawn(move || serve_connection(stream, &config, handler.as_ref()));
    }
}

fn serve_connection(stream: UnixStream, config: &RuntimeConfig, handler: &dyn TagHandler) {
    debug!("accepted plugin connection");
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            warn!("could not clone accepted stream: {err}");
            return;
        }
    };

    match session::run_session(reader, &stream, &config.key_path, handler) {
        Ok(()) => debug!("session closed cleanly"),
        Err(err) => warn!("session ended with error: {err}"),
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Long-lived server mode. The spawning host hands down an already-bound,
/// already-listening Unix socket as the process's standard input.
pub fn run_server<H>(config: RuntimeConfig, handler: H) -> Result<(), RunError>
where
    H: TagHandler + 'static,
{
    // Safety: by the host contract fd 0 is a listening Unix-domain socket
    // owned by this process for its whole lifetime.
    let listener = unsafe { UnixListener::from_raw_fd(io::stdin().as_raw_fd()) };
    serve(listener, config, handler)
}

/// One-shot filter mode: a single session over the process's own stdin
/// and stdout.
pub fn run_filter(config: &RuntimeConfig, handler: &dyn TagHandler) -> Result<(), RunError> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    session::run_session(stdin.lock(), stdout.lock(), &config.key_path, handler)
        .map_err(RunError::Session)
}

pub fn auto_run<H>(config: RuntimeConfig, handler: H) -> Result<(), RunError>
where
    H: TagHandler + 'static,
{
    let invoked_as = env::args().next().unwrap_or_default();
    if is_filter_invocation(&invoked_as) {
        run_filter(&config, &handler)
    } else {
        run_server(config, handler)
    }
}

pub fn is_filter_invocation(argv0: &str) -> bool {
    argv0.ends_with(FILTER_SUFFIX)
}
