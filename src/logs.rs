//! Reading the logs the stack writes, and cleaning up logs, temporary and build files.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::{config::ServiceDescriptor, config::ServiceId, runtime::StackLayout};

/// Log written by the daemon itself, as opposed to the captured console output.
pub fn daemon_log(layout: &StackLayout, service: ServiceId) -> PathBuf {
    match service {
        ServiceId::WebServer => layout.nginx_dir().join("logs/error.log"),
        ServiceId::FastCgiManager => layout.php_current().join("logs/php-fpm.log"),
        ServiceId::Database => layout.mariadb_dir().join("logs/error.log"),
    }
}

/// Every log belonging to a service: the daemon log first, then captured output.
pub fn service_logs(layout: &StackLayout, descriptor: &ServiceDescriptor) -> Vec<PathBuf> {
    let mut paths = vec![daemon_log(layout, descriptor.id)];
    if !paths.contains(&descriptor.log_file) {
        paths.push(descriptor.log_file.clone());
    }
    paths
}

/// Returns the last `lines` lines of `path`.
pub fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);
    Ok(all_lines.split_off(start))
}

/// Prints the tail of each log in `paths`, with a header per file.
pub fn show_logs(paths: &[PathBuf], lines: usize) -> io::Result<()> {
    for path in paths {
        println!("==> {} <==", path.display());
        match tail(path, lines) {
            Ok(tail) => {
                for line in tail {
                    println!("{line}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                println!("(no log yet)");
            }
            Err(err) => return Err(err),
        }
        println!();
    }
    Ok(())
}

/// Directories scanned for `*.log` files by [`clean_logs`].
fn log_dirs(layout: &StackLayout) -> Vec<PathBuf> {
    let mut dirs = vec![
        layout.nginx_dir().join("logs"),
        layout.mariadb_dir().join("logs"),
    ];
    if let Ok(entries) = fs::read_dir(layout.php_root()) {
        let mut versions: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            // the alias would visit the same directory twice
            .filter(|path| path.is_dir() && !path.is_symlink())
            .map(|path| path.join("logs"))
            .collect();
        versions.sort();
        dirs.extend(versions);
    }
    dirs
}

/// Truncates every non-empty `*.log` file. Returns the files that were emptied.
///
/// Files are truncated rather than removed so running daemons keep a valid handle.
pub fn clean_logs(layout: &StackLayout) -> io::Result<Vec<PathBuf>> {
    let mut cleaned = Vec::new();
    for dir in log_dirs(layout) {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
                continue;
            }
            let meta = fs::metadata(&path)?;
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            OpenOptions::new().write(true).truncate(true).open(&path)?;
            debug!("Truncated {}", path.display());
            cleaned.push(path);
        }
    }
    info!("Cleaned {} log file(s)", cleaned.len());
    Ok(cleaned)
}

/// Removes plain files from the stack's temporary directories. Returns how many went.
pub fn clean_temp(layout: &StackLayout) -> io::Result<usize> {
    let mut removed = 0;
    for dir in [layout.tmp_dir(), layout.mariadb_dir().join("tmp")] {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!("Could not remove {}: {err}", entry.path().display()),
            }
        }
    }
    info!("Cleaned {removed} temporary file(s)");
    Ok(removed)
}

/// Empties the build directory and removes downloaded archives. Returns the bytes freed.
pub fn clean_build(layout: &StackLayout) -> io::Result<u64> {
    let mut freed = 0;
    for (dir, include_dirs) in [(layout.build_dir(), true), (layout.downloads_dir(), false)] {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                if include_dirs {
                    let size = tree_size(&path)?;
                    fs::remove_dir_all(&path)?;
                    freed += size;
                }
            } else {
                freed += entry.metadata()?.len();
                fs::remove_file(&path)?;
            }
            debug!("Removed {}", path.display());
        }
    }
    info!("Freed {freed} byte(s) of build files");
    Ok(freed)
}

fn tree_size(dir: &Path) -> io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            size += tree_size(&entry.path())?;
        } else if kind.is_file() {
            size += entry.metadata()?.len();
        }
    }
    Ok(size)
}
