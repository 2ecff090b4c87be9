// Proxy binary resolution
// reason: shellexpand for `~` in configured paths

use std::path::{Path, PathBuf};
use tracing::debug;

use reflector_core::port::LaunchError;

/// Environment variable overriding the proxy binary location
pub const PROXY_PATH_ENV: &str = "REFLECTOR_PROXY_PATH";

/// Base name of the proxy executable
pub const PROXY_BIN_NAME: &str = "punch-proxy";

/// Platform-specific executable file name
pub fn executable_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
    }
}

/// Resolves the proxy executable for packaged and development layouts
#[derive(Debug, Clone)]
pub struct BinaryResolver {
    file_name: String,
    explicit: Option<PathBuf>,
    env_override: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
    project_root: Option<PathBuf>,
}

impl BinaryResolver {
    /// Resolver for the proxy, reading the environment and current executable
    pub fn for_proxy(configured: Option<&str>) -> Self {
        Self {
            file_name: executable_name(PROXY_BIN_NAME),
            explicit: configured.map(expand_path),
            env_override: std::env::var(PROXY_PATH_ENV).ok().map(|p| expand_path(&p)),
            exe_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            project_root: std::env::current_dir().ok(),
        }
    }

    /// Resolver with every location given explicitly
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            explicit: None,
            env_override: None,
            exe_dir: None,
            project_root: None,
        }
    }

    pub fn explicit(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    pub fn env_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_override = Some(path.into());
        self
    }

    pub fn exe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exe_dir = Some(dir.into());
        self
    }

    pub fn project_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_root = Some(dir.into());
        self
    }

    /// Candidate paths in priority order
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        out.extend(self.explicit.clone());
        out.extend(self.env_override.clone());
        if let Some(dir) = &self.exe_dir {
            out.push(dir.join(&self.file_name));
        }
        if let Some(root) = &self.project_root {
            for profile in ["release", "debug"] {
                out.push(root.join("target").join(profile).join(&self.file_name));
            }
        }
        out
    }

    /// First candidate that exists
    ///
    /// # Errors
    /// - LaunchError::NotFound listing every candidate tried
    pub fn resolve(&self) -> Result<PathBuf, LaunchError> {
        let candidates = self.candidates();
        for candidate in &candidates {
            debug!(candidate = %candidate.display(), "Probing proxy binary");
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        let tried = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(LaunchError::NotFound(format!(
            "{} (tried: {})",
            self.file_name, tried
        )))
    }
}
