//! Kernel dumps
//!
//! With `dump_dir` set, every new specialization writes
//! `<kernel>_<hash>.fwd.txt`, `<kernel>_<hash>.bwd.txt` and
//! `<kernel>_<hash>.json` into the directory.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ir::{render_kernel, KernelBody, Specialization};
use crate::synth::{BackwardKernel, ScatterReport};

/// Metadata written next to the rendered kernels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub kernel: String,
    pub specialization: Specialization,
    pub forward_nodes: usize,
    pub backward_nodes: usize,
    pub scatters: ScatterReport,
    pub version: String,
}

/// File stem for a kernel specialization.
pub fn dump_stem(kernel: &str, specialization: &Specialization) -> String {
    let mut hasher = DefaultHasher::new();
    specialization.hash(&mut hasher);
    format!("{}_{:016x}", kernel, hasher.finish())
}

/// Write the rendered forward and backward kernels plus metadata. Returns the
/// path of the metadata file.
pub fn write_dump(dir: &Path, forward: &KernelBody, backward: &BackwardKernel) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = dump_stem(&forward.name, &forward.specialization);

    std::fs::write(dir.join(format!("{stem}.fwd.txt")), render_kernel(forward))?;
    std::fs::write(dir.join(format!("{stem}.bwd.txt")), render_kernel(&backward.body))?;

    let metadata = DumpMetadata {
        kernel: forward.name.clone(),
        specialization: forward.specialization.clone(),
        forward_nodes: forward.len(),
        backward_nodes: backward.body.len(),
        scatters: backward.report.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let json = serde_json::to_string_pretty(&metadata).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let meta_path = dir.join(format!("{stem}.json"));
    std::fs::write(&meta_path, json)?;

    debug!("dumped `{}` to {}", forward.name, meta_path.display());
    Ok(meta_path)
}

/// Like [`write_dump`], but failures are only logged.
pub(crate) fn dump_or_warn(dir: &Path, forward: &KernelBody, backward: &BackwardKernel) {
    if let Err(err) = write_dump(dir, forward, backward) {
        warn!("failed to dump `{}` into {}: {err}", forward.name, dir.display());
    }
}

/// Read back the metadata of a dump.
pub fn read_metadata(path: &Path) -> io::Result<DumpMetadata> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}
