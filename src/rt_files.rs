//! Resolution of symbolic routing table and protocol names.
//!
//! Names are looked up in the iproute2 configuration files
//! (`/etc/iproute2/rt_tables` plus `rt_tables.d/*.conf`, and the analogous
//! protocol files). Files contain `<id> <name>` lines; the first match
//! wins and missing files are skipped. Lookups are rare (configuration
//! load only), so nothing is cached.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Paths scanned to resolve a routing table name.
pub fn table_paths() -> Vec<PathBuf> {
    expand(
        Path::new("/etc/iproute2/rt_tables"),
        Path::new("/etc/iproute2/rt_tables.d"),
    )
}

/// Paths scanned to resolve a routing protocol name.
pub fn protocol_paths() -> Vec<PathBuf> {
    expand(
        Path::new("/etc/iproute2/rt_protos"),
        Path::new("/etc/iproute2/rt_protos.d"),
    )
}

/// Returns `file` followed by the `*.conf` entries of `dir`, sorted for a
/// deterministic scan order.
fn expand(file: &Path, dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![file.to_path_buf()];
    if let Ok(entries) = fs::read_dir(dir) {
        let mut confs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        confs.sort();
        paths.extend(confs);
    }
    paths
}

/// Searches the given files for `name` and returns its numeric id.
///
/// Unreadable files are skipped, as are lines that do not start with a
/// numeric id (comments included). Ids above 255 do not fit in a route
/// message and are rejected.
pub fn find_name(paths: &[PathBuf], name: &str) -> Result<u32> {
    for path in paths {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(entry)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(id) = id.parse::<u32>() else {
                continue;
            };
            if entry == name {
                if id > 255 {
                    return Err(Error::Config(format!(
                        "id {} for name {:?} is out of range",
                        id, name
                    )));
                }
                return Ok(id);
            }
        }
    }
    Err(Error::Config(format!("name {:?} not found", name)))
}
