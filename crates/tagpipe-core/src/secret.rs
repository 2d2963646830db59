use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const KEY_DIR: &str = ".dillo";
const KEY_FILE: &str = "dpid_comm_keys";

// The host distributes a process id and a key string, whitespace-separated.
// Only the key gates access; the process id is parsed but never compared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedSecret {
    pub pid: i32,
    pub key: String,
}

#[derive(Debug)]
pub enum AuthError {
    NoHomeDir,
    Unreadable { path: PathBuf, source: io::Error },
    Malformed { path: PathBuf, detail: String },
    WrongKey { presented: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomeDir => write!(f, "home directory could not be resolved"),
            Self::Unreadable { path, source } => {
                write!(f, "secret file {} unreadable: {source}", path.display())
            }
            Self::Malformed { path, detail } => {
                write!(f, "secret file {} malformed: {detail}", path.display())
            }
            Self::WrongKey { presented } => write!(f, "wrong session key: '{presented}'"),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable { source, .. } => Some(source),
            Self::NoHomeDir | Self::Malformed { .. } | Self::WrongKey { .. } => None,
        }
    }
}

pub fn default_key_path() -> Result<PathBuf, AuthError> {
    dirs::home_dir()
        .map(|home| home.join(KEY_DIR).join(KEY_FILE))
        .ok_or(AuthError::NoHomeDir)
}

pub fn load(path: &Path) -> Result<SharedSecret, AuthError> {
    let raw = fs::read_to_string(path).map_err(|source| AuthError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let mut fields = raw.split_whitespace();
    let pid = fields
        .next()
        .ok_or_else(|| malformed(path, "missing process id"))?
        .parse::<i32>()
        .map_err(|_| malformed(path, "process id is not a number"))?;
    let key = fields
        .next()
        .ok_or_else(|| malformed(path, "missing key"))?
        .to_string();

    Ok(SharedSecret { pid, key })
}

fn malformed(path: &Path, detail: &str) -> AuthError {
    AuthError::Malformed {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

impl SharedSecret {
    pub fn verify(&self, presented: &str) -> Result<(), AuthError> {
        if presented == self.key {
            Ok(())
        } else {
            Err(AuthError::WrongKey {
                presented: presented.to_string(),
            })
        }
    }
}
