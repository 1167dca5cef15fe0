//! Session state: cookie jar and caller identity
//!
//! The cookie jar is a browser-export JSON file (an array of
//! `{name, value, domain, ...}` objects). Only cookies for the upstream
//! domains are kept. The jar must carry the CSRF cookie (`ct0`) and the
//! session-auth cookie (`auth_token`); anything else is forwarded
//! opaquely.
//!
//! The parsed jar is held in memory together with the file's mtime; it is
//! re-read only on auth recovery or when the file changes on disk.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{AppError, Result};

/// CSRF cookie, mirrored into a request header on every mutating call.
pub const CSRF_COOKIE: &str = "ct0";
/// Session-auth cookie.
pub const AUTH_COOKIE: &str = "auth_token";

const UPSTREAM_DOMAINS: &[&str] = &[".x.com", ".twitter.com", "x.com", "twitter.com"];

#[derive(Debug, Deserialize)]
struct ExportedCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: String,
}

/// In-memory session state for one caller
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    cookies: BTreeMap<String, String>,
    loaded_mtime: Option<SystemTime>,
    caller_id: Option<String>,
}

impl SessionStore {
    /// Load the cookie jar from disk. A missing file or a jar without the
    /// two mandatory cookies is a hard configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let (cookies, mtime) = Self::read_jar(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            cookies,
            loaded_mtime: mtime,
            caller_id: None,
        })
    }

    fn read_jar(path: &Path) -> Result<(BTreeMap<String, String>, Option<SystemTime>)> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read cookie jar {}: {}", path.display(), e))
        })?;

        let exported: Vec<ExportedCookie> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!(
                "invalid cookie jar {} (expected a browser-export JSON array): {}",
                path.display(),
                e
            ))
        })?;

        let cookies: BTreeMap<String, String> = exported
            .into_iter()
            .filter(|c| c.domain.is_empty() || UPSTREAM_DOMAINS.contains(&c.domain.as_str()))
            .map(|c| (c.name, c.value))
            .collect();

        for required in [CSRF_COOKIE, AUTH_COOKIE] {
            if !cookies.contains_key(required) {
                return Err(AppError::Config(format!(
                    "cookie jar {} is missing the required '{}' cookie; re-export your session",
                    path.display(),
                    required
                )));
            }
        }

        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        Ok((cookies, mtime))
    }

    /// Unconditionally re-read the jar. Used by the auth-recovery path;
    /// also clears the cached caller id since the session may have changed.
    pub fn reload(&mut self) -> Result<()> {
        let (cookies, mtime) = Self::read_jar(&self.path)?;
        self.cookies = cookies;
        self.loaded_mtime = mtime;
        self.caller_id = None;
        tracing::info!(path = %self.path.display(), "cookie jar reloaded");
        Ok(())
    }

    /// Re-read only when the file changed on disk since the last load.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        let current = std::fs::metadata(&self.path)
            .ok()
            .and_then(|m| m.modified().ok());
        if current.is_some() && current != self.loaded_mtime {
            self.reload()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// CSRF token value, mirrored into the `x-csrf-token` header.
    pub fn csrf_token(&self) -> &str {
        self.cookies
            .get(CSRF_COOKIE)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Assemble the `Cookie` header value from the whole jar.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.caller_id.as_deref()
    }

    pub fn set_caller_id(&mut self, id: String) {
        self.caller_id = Some(id);
    }

    pub fn clear_caller_id(&mut self) {
        self.caller_id = None;
    }
}
