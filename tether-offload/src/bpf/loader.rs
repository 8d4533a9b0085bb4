//! Boot-time network BPF object loader.
//!
//! Loads every BPF ELF object found under the configured directories,
//! creates or reuses the pinned maps under the netd pin root, loads each
//! program and pins it so the daemon can attach it later by path. Runs
//! once at boot ahead of the daemon, as the `netbpfload` binary.

use std::fs;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use aya::programs::Program;
use aya::EbpfLoader;
use tracing::{debug, info, warn};

use tether_offload_common::NET_BPF_LOAD_DONE_MARKER;

use crate::bpf::syscalls;

/// Objects the system cannot function without; failure to load one fails
/// the whole bring-up. Any other object is best-effort.
const CRITICAL_OBJECT_STEMS: &[&str] = &["netd", "offload", "clatd"];

pub struct LoaderConfig {
    /// Directories scanned for `*.o` ELF objects.
    pub object_dirs: Vec<PathBuf>,
    /// Directory maps and programs are pinned under.
    pub pin_root: PathBuf,
    /// Additional marker files written after a successful load, e.g. the
    /// platform progs-loaded marker the daemon blocks on.
    pub extra_markers: Vec<PathBuf>,
}

/// Load and pin everything, then publish the completion markers.
pub fn load_all(config: &LoaderConfig) -> Result<()> {
    fs::create_dir_all(&config.pin_root)
        .with_context(|| format!("creating pin root {}", config.pin_root.display()))?;

    let mut programs = 0usize;
    for dir in &config.object_dirs {
        for object in list_objects(dir)? {
            let critical = is_critical(&object);
            match load_object(&object, &config.pin_root) {
                Ok(count) => {
                    programs += count;
                    info!(object = %object.display(), programs = count, "loaded BPF object");
                }
                Err(e) if critical => {
                    return Err(e)
                        .with_context(|| format!("loading critical object {}", object.display()));
                }
                Err(e) => {
                    warn!(object = %object.display(), error = %e, "skipping optional BPF object");
                }
            }
        }
    }

    let done = config.pin_root.join(NET_BPF_LOAD_DONE_MARKER);
    for marker in std::iter::once(&done).chain(&config.extra_markers) {
        fs::write(marker, b"").with_context(|| format!("writing marker {}", marker.display()))?;
    }

    info!(programs, "network BPF load complete");
    Ok(())
}

fn list_objects(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "object directory missing");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };

    let mut objects: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "o"))
        .collect();
    objects.sort();
    Ok(objects)
}

fn is_critical(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| CRITICAL_OBJECT_STEMS.contains(&stem))
}

/// Load one object. Maps marked for pinning are created or reused by name
/// under the pin root; every supported program is loaded and pinned as
/// `prog_<object-stem>_<program-name>`.
fn load_object(path: &Path, pin_root: &Path) -> Result<usize> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("object file name is not valid UTF-8")?;

    let mut object = EbpfLoader::new()
        .map_pin_path(pin_root)
        .load_file(path)
        .with_context(|| format!("parsing {}", path.display()))?;

    let names: Vec<String> = object
        .programs()
        .map(|(name, _)| name.to_string())
        .collect();

    let mut pinned = 0usize;
    for name in names {
        let pin_path = pin_root.join(format!("prog_{stem}_{name}"));
        if pin_path.exists() {
            // A previous boot already pinned it; the kernel keeps the
            // program alive through the pin.
            debug!(program = %name, "already pinned");
            pinned += 1;
            continue;
        }

        let program = object
            .program_mut(&name)
            .with_context(|| format!("program {name} disappeared from object"))?;
        load_program(&name, program)?;
        let fd = program
            .fd()
            .with_context(|| format!("program {name} has no loaded fd"))?;
        syscalls::obj_pin(fd.as_fd(), &pin_path)
            .with_context(|| format!("pinning {}", pin_path.display()))?;
        debug!(program = %name, pin = %pin_path.display(), "pinned program");
        pinned += 1;
    }
    Ok(pinned)
}

fn load_program(name: &str, program: &mut Program) -> Result<()> {
    match program {
        Program::CgroupSkb(p) => p.load()?,
        Program::CgroupSock(p) => p.load()?,
        Program::CgroupSockAddr(p) => p.load()?,
        Program::CgroupSockopt(p) => p.load()?,
        Program::SocketFilter(p) => p.load()?,
        Program::SchedClassifier(p) => p.load()?,
        _ => bail!("program {name} has an unsupported type"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criticality_by_object_stem() {
        assert!(is_critical(Path::new("/etc/bpf/netd.o")));
        assert!(is_critical(Path::new("offload.o")));
        assert!(is_critical(Path::new("clatd.o")));
        assert!(!is_critical(Path::new("/etc/bpf/dns_filter.o")));
        assert!(!is_critical(Path::new("netd")));
    }

    #[test]
    fn test_list_objects_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zz.o", "aa.o", "notes.txt", "mid.o.bak"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let objects = list_objects(dir.path()).unwrap();
        let names: Vec<_> = objects
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["aa.o", "zz.o"]);
    }

    #[test]
    fn test_missing_object_dir_is_empty() {
        assert!(list_objects(Path::new("/nonexistent/tether-offload")).unwrap().is_empty());
    }

    #[test]
    fn test_markers_written_even_with_no_objects() {
        let dir = tempfile::tempdir().unwrap();
        let pin_root = dir.path().join("pins");
        let extra = dir.path().join("bpf_progs_loaded");
        let config = LoaderConfig {
            object_dirs: vec![dir.path().join("objs")],
            pin_root: pin_root.clone(),
            extra_markers: vec![extra.clone()],
        };

        load_all(&config).unwrap();
        assert!(pin_root.join(NET_BPF_LOAD_DONE_MARKER).exists());
        assert!(extra.exists());
    }
}
