use crate::secret::{self, AuthError};
use crate::tag::{self, FramingError, Tag};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Done,
}

/// Caller-supplied logic invoked once per non-auth tag. The writer handed
/// to `handle` never raises; the loop checks for dropped bytes after the
/// handler returns.
pub trait TagHandler: Send + Sync {
    fn handle(&self, request: &Tag, out: &mut dyn Write) -> Result<Control, HandlerError>;
}

impl<F> TagHandler for F
where
    F: Fn(&Tag, &mut dyn Write) -> Result<Control, HandlerError> + Send + Sync,
{
    fn handle(&self, request: &Tag, out: &mut dyn Write) -> Result<Control, HandlerError> {
        self(request, out)
    }
}

/// Write wrapper that records the first failure and reports success for
/// that and every later write; the recorded error stays queryable after
/// the handler returns.
pub struct WriteGuard<W: Write> {
    inner: W,
    failure: Option<io::Error>,
}

impl<W: Write> WriteGuard<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            failure: None,
        }
    }

    pub fn failure(&self) -> Option<&io::Error> {
        self.failure.as_ref()
    }

    pub fn into_failure(self) -> Option<io::Error> {
        self.failure
    }
}

impl<W: Write> Write for WriteGuard<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failure.is_some() {
            return Ok(buf.len());
        }
        match self.inner.write(buf) {
            Ok(written) => Ok(written),
            Err(err) => {
                self.failure = Some(err);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        if let Err(err) = self.inner.flush() {
            self.failure = Some(err);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SessionError {
    Framing(FramingError),
    Auth(AuthError),
    Handler(HandlerError),
    Write(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing(err) => write!(f, "failed to parse tag: {err}"),
            Self::Auth(err) => write!(f, "auth failed: {err}"),
            Self::Handler(err) => write!(f, "{err}"),
            Self::Write(err) => write!(f, "write to peer failed: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Framing(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Handler(err) => {
                let err: &(dyn std::error::Error + 'static) = err.as_ref();
                Some(err)
            }
            Self::Write(err) => Some(err),
        }
    }
}

/// Runs one session: reads tags until the handler asks to stop or the
/// stream fails. A tag carrying `cmd='auth'` is consumed by the key check
/// and never reaches the handler; every other tag is dispatched regardless
/// of whether the peer authenticated first.
pub fn run_session<R, W>(
    reader: R,
    mut writer: W,
    key_path: &Path,
    handler: &dyn TagHandler,
) -> Result<(), SessionError>
where
    R: Read,
    W: Write,
{
    let mut reader = BufReader::new(reader);
    loop {
        let request = tag::read_tag(&mut reader).map_err(SessionError::Framing)?;

        if request.get("cmd").map(String::as_str) == Some("auth") {
            let presented = request.get("msg").map(String::as_str).unwrap_or("");
            if let Err(err) = authenticate(key_path, presented) {
                warn!("session auth failed: {err}");
                return Err(SessionError::Auth(err));
            }
            debug!("session authenticated");
            continue;
        }

        let mut guard = WriteGuard::new(&mut writer);
        let outcome = handler.handle(&request, &mut guard);
        let write_failure = guard.into_failure();

        let control = outcome.map_err(SessionError::Handler)?;
        // Lost response bytes outrank whatever the handler reported.
        if let Some(err) = write_failure {
            return Err(SessionError::Write(err));
        }
        match control {
            Control::Done => return Ok(()),
            Control::Continue => {}
        }
    }
}

fn authenticate(key_path: &Path, presented: &str) -> Result<(), AuthError> {
    let shared = secret::load(key_path)?;
    shared.verify(presented)
}
