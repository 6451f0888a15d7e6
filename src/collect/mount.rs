use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Mount point of the first mounted partition on a removable disk.
pub fn find_removable_mount() -> Option<PathBuf> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    let partitions = removable_partitions(Path::new("/sys/block"));

    if partitions.is_empty() {
        debug!("no removable partitions found");
        return None;
    }

    let mount = first_mount_of(&partitions, &mounts);
    if mount.is_none() {
        debug!(partitions = partitions.len(), "removable partitions are not mounted");
    }
    mount
}

/// Partition device nodes (`/dev/sdb1`) of all disks flagged removable.
fn removable_partitions(sys_block: &Path) -> HashSet<String> {
    let mut partitions = HashSet::new();

    let Ok(entries) = fs::read_dir(sys_block) else {
        return partitions;
    };

    for entry in entries.flatten() {
        let disk = entry.path();
        if read_trimmed(&disk.join("removable")).as_deref() != Some("1") {
            continue;
        }

        let Ok(children) = fs::read_dir(&disk) else {
            continue;
        };

        for child in children.flatten() {
            if child.path().join("partition").is_file() {
                let name = child.file_name();
                partitions.insert(format!("/dev/{}", name.to_string_lossy()));
            }
        }
    }

    partitions
}

/// First `/proc/mounts` entry whose device is one of `partitions`.
fn first_mount_of(partitions: &HashSet<String>, mounts: &str) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let mount_point = fields.next()?;
        partitions
            .contains(device)
            .then(|| PathBuf::from(unescape_mount_path(mount_point)))
    })
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn read_trimmed(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    Some(text.trim().to_string())
}
