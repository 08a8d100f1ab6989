//! The saved plan artifact.
//!
//! An opaque framed container: magic, format version, then length-prefixed
//! sections (plan + prior state + variables as one JSON document, and the
//! configuration snapshot), each passed through the plan encryption hook.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path as FsPath;

use anyhow::{bail, Context, Result};

use crate::encryption::{ArtifactKind, EncryptionHook};
use super::objects::Plan;

const MAGIC: &[u8; 6] = b"GWPLAN";
const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct PlanFile {
    pub plan: Plan,
    /// Relative file name -> source text, captured at plan time so apply
    /// runs against the exact configuration that was planned.
    pub config_snapshot: BTreeMap<String, String>,
}

impl PlanFile {
    pub fn new(plan: Plan, config_snapshot: BTreeMap<String, String>) -> PlanFile {
        PlanFile {
            plan,
            config_snapshot,
        }
    }
}

/// Captures the `*.gw.hcl` sources under `dir`.
pub fn snapshot_config(dir: &FsPath) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    snapshot_into(dir, FsPath::new(""), &mut out)?;
    Ok(out)
}

fn snapshot_into(
    dir: &FsPath,
    prefix: &FsPath,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !name.starts_with('.') {
                snapshot_into(&path, &prefix.join(&name), out)?;
            }
        } else if name.ends_with(".gw.hcl") {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            out.insert(prefix.join(&name).display().to_string(), contents);
        }
    }
    Ok(())
}

pub fn write_plan_file(
    path: &FsPath,
    plan_file: &PlanFile,
    hook: &dyn EncryptionHook,
) -> Result<()> {
    let mut f = std::fs::File::create(path)
        .with_context(|| format!("creating plan file {}", path.display()))?;
    f.write_all(MAGIC)?;
    f.write_all(&[VERSION])?;

    let sections = [
        serde_json::to_vec(&plan_file.plan).context("encoding plan")?,
        serde_json::to_vec(&plan_file.config_snapshot).context("encoding config snapshot")?,
    ];
    for section in sections {
        let sealed = hook
            .encrypt(&section, ArtifactKind::Plan)
            .context("encrypting plan section")?;
        f.write_all(&(sealed.len() as u32).to_le_bytes())?;
        f.write_all(&sealed)?;
    }
    f.flush()?;
    Ok(())
}

pub fn read_plan_file(path: &FsPath, hook: &dyn EncryptionHook) -> Result<PlanFile> {
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("opening plan file {}", path.display()))?;
    let mut magic = [0u8; 6];
    f.read_exact(&mut magic).context("reading plan file header")?;
    if &magic != MAGIC {
        bail!("{} is not a saved plan", path.display());
    }
    let mut version = [0u8; 1];
    f.read_exact(&mut version)?;
    if version[0] != VERSION {
        bail!("unsupported plan file version {}", version[0]);
    }

    let mut read_section = |f: &mut std::fs::File| -> Result<Vec<u8>> {
        let mut len = [0u8; 4];
        f.read_exact(&mut len)?;
        let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
        f.read_exact(&mut buf)?;
        hook.decrypt(&buf, ArtifactKind::Plan)
            .context("decrypting plan section")
    };

    let plan: Plan =
        serde_json::from_slice(&read_section(&mut f)?).context("decoding plan")?;
    let config_snapshot: BTreeMap<String, String> =
        serde_json::from_slice(&read_section(&mut f)?).context("decoding config snapshot")?;

    Ok(PlanFile {
        plan,
        config_snapshot,
    })
}

/// Materializes a snapshot into a directory so the loader can re-parse it.
pub fn restore_snapshot(snapshot: &BTreeMap<String, String>, dir: &FsPath) -> Result<()> {
    for (name, contents) in snapshot {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{AeadEncryption, Disabled, Passphrase};
    use crate::plan::objects::PlanMode;
    use crate::state::State;

    fn sample() -> PlanFile {
        let plan = Plan::new(PlanMode::Normal, State::new());
        let snapshot = [(
            "main.gw.hcl".to_string(),
            "resource \"null\" \"a\" {}\n".to_string(),
        )]
        .into_iter()
        .collect();
        PlanFile::new(plan, snapshot)
    }

    #[test]
    fn round_trip_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gwplan");
        let original = sample();
        write_plan_file(&path, &original, &Disabled).unwrap();
        let back = read_plan_file(&path, &Disabled).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn round_trip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gwplan");
        let hook = AeadEncryption::new(Passphrase::new("k"));
        let original = sample();
        write_plan_file(&path, &original, &hook).unwrap();
        let back = read_plan_file(&path, &hook).unwrap();
        assert_eq!(back, original);

        let wrong = AeadEncryption::new(Passphrase::new("other"));
        assert!(read_plan_file(&path, &wrong).is_err());
    }

    #[test]
    fn rejects_non_plan_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-plan");
        std::fs::write(&path, b"{\"state\": true}").unwrap();
        assert!(read_plan_file(&path, &Disabled).is_err());
    }

    #[test]
    fn snapshot_and_restore() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("net")).unwrap();
        std::fs::write(src.path().join("main.gw.hcl"), "a = 1\n").unwrap();
        std::fs::write(src.path().join("net/net.gw.hcl"), "b = 2\n").unwrap();
        std::fs::write(src.path().join("notes.txt"), "ignored").unwrap();

        let snapshot = snapshot_config(src.path()).unwrap();
        assert_eq!(snapshot.len(), 2);

        let dst = tempfile::tempdir().unwrap();
        restore_snapshot(&snapshot, dst.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("net/net.gw.hcl")).unwrap(),
            "b = 2\n"
        );
    }
}
