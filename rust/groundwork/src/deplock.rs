//! The dependency lock file.
//!
//! Records, per provider source address, the selected version, the accepted
//! constraints, and a multi-platform set of archive hashes so a lock file
//! committed from one platform still lets a collaborator on another verify
//! integrity. The file is HCL text, conventionally `.groundwork.lock.hcl`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const LOCK_FILE_NAME: &str = ".groundwork.lock.hcl";

/// Hash scheme prefix for provider archive digests.
const HASH_SCHEME: &str = "gw1";

#[derive(Debug, Error)]
pub enum LockFileError {
    #[error("invalid lock file: {0}")]
    Invalid(String),
    #[error("provider {0} is not in the dependency lock file")]
    NotLocked(String),
    #[error(
        "provider {provider} changed (locked {locked}, requested {requested}) but the lock is read-only"
    )]
    ReadOnlyViolation {
        provider: String,
        locked: String,
        requested: String,
    },
    #[error("checksum mismatch for {provider}: {hash} is not in the locked hash set")]
    ChecksumMismatch { provider: String, hash: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Update behavior for lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Record providers seen for the first time; keep existing selections.
    InstallNewOnly,
    /// Reselect versions within constraints, replacing recorded entries.
    Upgrade,
    /// Any change to the provider set or versions is an error.
    ReadOnly,
}

/// One locked provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLock {
    /// Source address, `hostname/namespace/type`.
    pub source: String,
    pub version: String,
    pub constraints: Option<String>,
    /// `gw1:<hex sha256>` entries, optionally suffixed `:<os>_<arch>`.
    pub hashes: BTreeSet<String>,
}

impl ProviderLock {
    /// Platforms for which a platform-suffixed hash is recorded.
    pub fn platforms(&self) -> BTreeSet<String> {
        self.hashes
            .iter()
            .filter_map(|h| h.splitn(3, ':').nth(2).map(String::from))
            .collect()
    }

    /// A provider whose hashes cover only the current platform cannot be
    /// verified elsewhere.
    pub fn is_incomplete_for(&self, platforms: &[&str]) -> bool {
        let covered = self.platforms();
        platforms.iter().any(|p| !covered.contains(*p))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockFile {
    pub providers: BTreeMap<String, ProviderLock>,
}

/// Digest of a provider archive in the lock file's hash scheme, optionally
/// tagged with the platform it was built for.
pub fn hash_archive(bytes: &[u8], platform: Option<&str>) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    match platform {
        Some(p) => format!("{}:{}:{}", HASH_SCHEME, digest, p),
        None => format!("{}:{}", HASH_SCHEME, digest),
    }
}

fn hash_digest_part(hash: &str) -> Option<&str> {
    hash.splitn(3, ':').nth(1)
}

impl LockFile {
    pub fn read(path: &FsPath) -> Result<LockFile, LockFileError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LockFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<LockFile, LockFileError> {
        let body = hcl::parse(contents).map_err(|e| LockFileError::Invalid(e.to_string()))?;
        let mut providers = BTreeMap::new();
        for structure in body {
            let block = match structure {
                hcl::Structure::Block(b) => b,
                hcl::Structure::Attribute(a) => {
                    return Err(LockFileError::Invalid(format!(
                        "unexpected attribute {:?}",
                        a.key.as_str()
                    )))
                }
            };
            if block.identifier.as_str() != "provider" {
                return Err(LockFileError::Invalid(format!(
                    "unexpected block {:?}",
                    block.identifier.as_str()
                )));
            }
            let source = match block.labels.first() {
                Some(hcl::BlockLabel::String(s)) => s.clone(),
                Some(hcl::BlockLabel::Identifier(id)) => id.to_string(),
                None => {
                    return Err(LockFileError::Invalid(
                        "provider block needs a source label".to_string(),
                    ))
                }
            };

            let mut version = None;
            let mut constraints = None;
            let mut hashes = BTreeSet::new();
            for structure in block.body {
                if let hcl::Structure::Attribute(attr) = structure {
                    match attr.key.as_str() {
                        "version" => {
                            if let hcl::Expression::String(s) = &attr.expr {
                                version = Some(s.clone());
                            }
                        }
                        "constraints" => {
                            if let hcl::Expression::String(s) = &attr.expr {
                                constraints = Some(s.clone());
                            }
                        }
                        "hashes" => {
                            if let hcl::Expression::Array(items) = &attr.expr {
                                for item in items {
                                    if let hcl::Expression::String(s) = item {
                                        hashes.insert(s.clone());
                                    }
                                }
                            }
                        }
                        other => {
                            return Err(LockFileError::Invalid(format!(
                                "unexpected attribute {:?} in provider {:?}",
                                other, source
                            )))
                        }
                    }
                }
            }
            let version = version.ok_or_else(|| {
                LockFileError::Invalid(format!("provider {:?} has no version", source))
            })?;
            providers.insert(
                source.clone(),
                ProviderLock {
                    source,
                    version,
                    constraints,
                    hashes,
                },
            );
        }
        Ok(LockFile { providers })
    }

    pub fn write(&self, path: &FsPath) -> Result<(), LockFileError> {
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut body = hcl::Body::builder();
        for lock in self.providers.values() {
            let mut block = hcl::Block::builder("provider")
                .add_label(lock.source.clone())
                .add_attribute(("version", lock.version.clone()));
            if let Some(constraints) = &lock.constraints {
                block = block.add_attribute(("constraints", constraints.clone()));
            }
            let hashes: Vec<hcl::Expression> = lock
                .hashes
                .iter()
                .map(|h| hcl::Expression::String(h.clone()))
                .collect();
            block = block.add_attribute(("hashes", hcl::Expression::Array(hashes)));
            body = body.add_block(block.build());
        }
        let body = body.build();
        let mut out = String::from(
            "# This file is maintained automatically by provider installation.\n# Manual edits may be lost on the next run.\n\n",
        );
        out.push_str(&hcl::to_string(&body).unwrap_or_default());
        out
    }

    /// Records a provider selection under the given mode.
    pub fn record(
        &mut self,
        mode: LockMode,
        source: &str,
        version: &str,
        constraints: Option<&str>,
        hashes: BTreeSet<String>,
    ) -> Result<(), LockFileError> {
        match self.providers.get_mut(source) {
            None => {
                if mode == LockMode::ReadOnly {
                    return Err(LockFileError::ReadOnlyViolation {
                        provider: source.to_string(),
                        locked: "(absent)".to_string(),
                        requested: version.to_string(),
                    });
                }
                self.providers.insert(
                    source.to_string(),
                    ProviderLock {
                        source: source.to_string(),
                        version: version.to_string(),
                        constraints: constraints.map(String::from),
                        hashes,
                    },
                );
            }
            Some(existing) => {
                if existing.version == version {
                    // Same selection; merge any newly-computed hashes.
                    if mode != LockMode::ReadOnly {
                        existing.hashes.extend(hashes);
                        existing.constraints = constraints.map(String::from);
                    }
                } else {
                    match mode {
                        LockMode::ReadOnly => {
                            return Err(LockFileError::ReadOnlyViolation {
                                provider: source.to_string(),
                                locked: existing.version.clone(),
                                requested: version.to_string(),
                            })
                        }
                        LockMode::InstallNewOnly => {
                            // Existing selection wins; the caller must use
                            // the locked version.
                        }
                        LockMode::Upgrade => {
                            existing.version = version.to_string();
                            existing.constraints = constraints.map(String::from);
                            existing.hashes = hashes;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Verifies an installed archive against the recorded hash set. The
    /// digest must match regardless of which platform computed it.
    pub fn verify(&self, source: &str, archive: &[u8]) -> Result<(), LockFileError> {
        let lock = self
            .providers
            .get(source)
            .ok_or_else(|| LockFileError::NotLocked(source.to_string()))?;
        let digest = hex::encode(Sha256::digest(archive));
        let matches = lock
            .hashes
            .iter()
            .any(|h| hash_digest_part(h) == Some(digest.as_str()));
        if matches {
            Ok(())
        } else {
            Err(LockFileError::ChecksumMismatch {
                provider: source.to_string(),
                hash: format!("{}:{}", HASH_SCHEME, digest),
            })
        }
    }

    /// Warnings for providers whose hashes do not cover `platforms`.
    pub fn incomplete_warnings(&self, platforms: &[&str]) -> Vec<String> {
        self.providers
            .values()
            .filter(|lock| lock.is_incomplete_for(platforms))
            .map(|lock| {
                let covered: Vec<String> = lock.platforms().into_iter().collect();
                format!(
                    "provider {} has checksums only for [{}]; collaborators on other platforms cannot verify it",
                    lock.source,
                    covered.join(", ")
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hashes(platform: &str) -> BTreeSet<String> {
        [hash_archive(b"archive-bytes", Some(platform))]
            .into_iter()
            .collect()
    }

    #[test]
    fn render_parse_round_trip() {
        let mut lock = LockFile::default();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            Some("~> 1.0"),
            sample_hashes("linux_amd64"),
        )
        .unwrap();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/file",
            "0.9.1",
            None,
            sample_hashes("darwin_arm64"),
        )
        .unwrap();

        let text = lock.render();
        let back = LockFile::parse(&text).unwrap();
        assert_eq!(back, lock);
    }

    #[test]
    fn verify_accepts_any_platform_hash() {
        let mut lock = LockFile::default();
        let mut hashes = sample_hashes("linux_amd64");
        hashes.extend(sample_hashes("darwin_arm64"));
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            None,
            hashes,
        )
        .unwrap();

        lock.verify("registry.groundwork.dev/core/null", b"archive-bytes")
            .unwrap();
        assert!(matches!(
            lock.verify("registry.groundwork.dev/core/null", b"tampered"),
            Err(LockFileError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            lock.verify("registry.groundwork.dev/other/x", b"archive-bytes"),
            Err(LockFileError::NotLocked(_))
        ));
    }

    #[test]
    fn readonly_mode_rejects_changes() {
        let mut lock = LockFile::default();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            None,
            sample_hashes("linux_amd64"),
        )
        .unwrap();

        assert!(matches!(
            lock.record(
                LockMode::ReadOnly,
                "registry.groundwork.dev/core/null",
                "1.3.0",
                None,
                BTreeSet::new(),
            ),
            Err(LockFileError::ReadOnlyViolation { .. })
        ));
        assert!(matches!(
            lock.record(
                LockMode::ReadOnly,
                "registry.groundwork.dev/core/new",
                "0.1.0",
                None,
                BTreeSet::new(),
            ),
            Err(LockFileError::ReadOnlyViolation { .. })
        ));
        // Unchanged selection is fine.
        lock.record(
            LockMode::ReadOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            None,
            BTreeSet::new(),
        )
        .unwrap();
    }

    #[test]
    fn install_new_only_keeps_existing_selection() {
        let mut lock = LockFile::default();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            None,
            sample_hashes("linux_amd64"),
        )
        .unwrap();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.9.9",
            None,
            BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(
            lock.providers["registry.groundwork.dev/core/null"].version,
            "1.2.0"
        );

        lock.record(
            LockMode::Upgrade,
            "registry.groundwork.dev/core/null",
            "1.9.9",
            Some(">= 1.9"),
            sample_hashes("linux_amd64"),
        )
        .unwrap();
        assert_eq!(
            lock.providers["registry.groundwork.dev/core/null"].version,
            "1.9.9"
        );
    }

    #[test]
    fn incomplete_platform_coverage_warns() {
        let mut lock = LockFile::default();
        lock.record(
            LockMode::InstallNewOnly,
            "registry.groundwork.dev/core/null",
            "1.2.0",
            None,
            sample_hashes("linux_amd64"),
        )
        .unwrap();
        let warnings = lock.incomplete_warnings(&["linux_amd64", "darwin_arm64"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("linux_amd64"));

        let none = lock.incomplete_warnings(&["linux_amd64"]);
        assert!(none.is_empty());
    }
}
