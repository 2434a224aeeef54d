//! Developer toolchain discovery
//!
//! Finds the active Xcode developer directory and its version. Both lookups
//! are memoized for the life of the process; [`clear_cache`] forgets them.

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use plist::Value as PlistValue;
use regex::Regex;

use rdbg_core::prelude::*;

use crate::process::{ProcessRunner, RunOptions};

const XCODE_SUBDIR: &str = "/Contents/Developer";
const XCODE_SELECT_TIMEOUT: Duration = Duration::from_secs(3);
const VERSION_KEY: &str = "CFBundleShortVersionString";

/// Where `xcode-select` stores the selected developer directory.
pub const SELECT_LINK: &str = "/var/db/xcode_select_link";
/// Location used by old `xcode-select` releases.
pub const LEGACY_SELECT_LINK: &str = "/usr/share/xcode-select/xcode_dir_path";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+(?:\.\d+)?").expect("Invalid version regex"));

static DEVELOPER_DIR_CACHE: Mutex<Option<PathBuf>> = Mutex::new(None);
static VERSION_CACHE: Mutex<Option<String>> = Mutex::new(None);

/// The active developer directory, e.g. `/Applications/Xcode.app/Contents/Developer`.
///
/// Asks `xcode-select --print-path` first; if that fails or prints nothing
/// usable, falls back to `DEVELOPER_DIR` and then the selection symlinks.
pub async fn developer_dir<R: ProcessRunner>(runner: &R) -> Result<PathBuf> {
    if let Some(cached) = lock(&DEVELOPER_DIR_CACHE).clone() {
        return Ok(cached);
    }

    let path = match path_from_xcode_select(runner).await {
        Ok(path) => path,
        Err(e) => {
            warn!("Finding developer dir by symlink because {}", e);
            let env_dir = std::env::var("DEVELOPER_DIR").ok();
            path_from_links(
                env_dir.as_deref(),
                &[Path::new(SELECT_LINK), Path::new(LEGACY_SELECT_LINK)],
            )?
        }
    };

    debug!("Developer dir: {}", path.display());
    *lock(&DEVELOPER_DIR_CACHE) = Some(path.clone());
    Ok(path)
}

/// The toolchain's short version string, e.g. `7.3.1`.
pub async fn version<R: ProcessRunner>(runner: &R) -> Result<String> {
    if let Some(cached) = lock(&VERSION_CACHE).clone() {
        return Ok(cached);
    }

    let dir = developer_dir(runner).await?;
    let version = read_version(&info_plist_path(&dir))?;
    *lock(&VERSION_CACHE) = Some(version.clone());
    Ok(version)
}

/// Newest iOS simulator SDK known to `xcrun`.
pub async fn max_ios_sdk<R: ProcessRunner>(runner: &R) -> Result<String> {
    let args = ["--sdk", "iphonesimulator", "--show-sdk-version"].map(String::from);
    let output = runner
        .run("xcrun", &args, RunOptions::with_timeout(Some(XCODE_SELECT_TIMEOUT)))
        .await?;
    let sdk = output.stdout.trim();
    if !VERSION_PATTERN.is_match(sdk) {
        return Err(Error::toolchain_not_found(format!(
            "xcrun returned a non-numeric iOS SDK version: {sdk}"
        )));
    }
    Ok(sdk.to_string())
}

/// Location of `xcrun` on `PATH`.
pub fn find_xcrun() -> Result<PathBuf> {
    which::which("xcrun").map_err(|e| Error::toolchain_not_found(format!("xcrun: {e}")))
}

/// Forget memoized lookups.
pub fn clear_cache() {
    *lock(&DEVELOPER_DIR_CACHE) = None;
    *lock(&VERSION_CACHE) = None;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn path_from_xcode_select<R: ProcessRunner>(runner: &R) -> Result<PathBuf> {
    let args = ["--print-path".to_string()];
    let output = runner
        .run(
            "xcode-select",
            &args,
            RunOptions::with_timeout(Some(XCODE_SELECT_TIMEOUT)),
        )
        .await?;

    let printed = output.stdout.trim();
    let printed = printed.strip_suffix('/').unwrap_or(printed);
    if printed.is_empty() {
        return Err(Error::toolchain_not_found("xcode-select returned an empty string"));
    }

    let path = PathBuf::from(printed);
    if !path.exists() {
        return Err(Error::toolchain_not_found(format!(
            "xcode-select path {} does not exist",
            path.display()
        )));
    }
    Ok(path)
}

/// Resolve the developer directory without `xcode-select`.
///
/// A non-empty `developer_dir` wins and must exist (with or without the
/// `Contents/Developer` suffix); otherwise the first existing link is read.
pub fn path_from_links(developer_dir: Option<&str>, links: &[&Path]) -> Result<PathBuf> {
    if let Some(dir) = developer_dir.filter(|d| !d.trim().is_empty()) {
        let custom = if dir.ends_with(XCODE_SUBDIR) {
            PathBuf::from(dir)
        } else {
            PathBuf::from(format!("{dir}{XCODE_SUBDIR}"))
        };
        if custom.exists() {
            return Ok(custom);
        }
        return Err(Error::toolchain_not_found(format!(
            "DEVELOPER_DIR set to {dir} but no Xcode found"
        )));
    }

    for link in links {
        if link.exists() {
            return std::fs::read_link(link)
                .with_context(|| format!("Failed to resolve {}", link.display()));
        }
    }

    let tried: Vec<String> = links.iter().map(|l| l.display().to_string()).collect();
    Err(Error::toolchain_not_found(format!(
        "no developer dir symlink in {}",
        tried.join(", ")
    )))
}

/// `.../Xcode.app/Contents/Developer` → `.../Xcode.app/Contents/Info.plist`
pub fn info_plist_path(developer_dir: &Path) -> PathBuf {
    let dir = developer_dir.to_string_lossy();
    PathBuf::from(dir.replace(XCODE_SUBDIR, "/Contents/Info.plist"))
}

/// Read the short version string from a bundle's `Info.plist`.
pub fn read_version(plist_path: &Path) -> Result<String> {
    if !plist_path.exists() {
        return Err(Error::toolchain_not_found(format!(
            "{} does not exist",
            plist_path.display()
        )));
    }

    let info = PlistValue::from_file(plist_path)
        .map_err(|e| Error::plist(format!("{}: {}", plist_path.display(), e)))?;
    let raw = info
        .as_dictionary()
        .and_then(|d| d.get(VERSION_KEY))
        .and_then(PlistValue::as_string)
        .ok_or_else(|| Error::plist(format!("{VERSION_KEY} missing from {}", plist_path.display())))?;

    VERSION_PATTERN
        .find(raw)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::toolchain_not_found(format!("could not parse version '{raw}'")))
}
