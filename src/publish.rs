// src/publish.rs
//! Atomic publication of the merged guide.
//!
//! The document is written to a temp file next to the target, fsynced, given
//! mode 0644 and renamed over the target. Readers either see the previous
//! guide or the new one, never a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::guide::xmltv::{self, XmltvError};
use crate::guide::MergedGuide;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("guide path {0:?} has no file name")]
    InvalidTarget(PathBuf),
    #[error("serializing guide: {0}")]
    Serialize(#[from] XmltvError),
    #[error("staging guide in {dir:?}: {source}")]
    Stage {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("replacing {target:?}: {source}")]
    Commit {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub channels: usize,
    pub programmes: usize,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    target: PathBuf,
}

impl Publisher {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Serialize `guide` into a synced temp file beside the target.
    /// Nothing visible changes until [`StagedGuide::commit`].
    pub fn stage(&self, guide: &MergedGuide) -> Result<StagedGuide, PublishError> {
        if self.target.file_name().is_none() {
            return Err(PublishError::InvalidTarget(self.target.clone()));
        }
        let dir = match self.target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stage_err = |source| PublishError::Stage {
            dir: dir.clone(),
            source,
        };

        let bytes = xmltv::write_guide(guide)?;
        let digest = hex(&Sha256::digest(&bytes));

        fs::create_dir_all(&dir).map_err(stage_err)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".guide-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(stage_err)?;
        temp.write_all(&bytes).map_err(stage_err)?;
        temp.as_file().sync_all().map_err(stage_err)?;
        set_readable(temp.path()).map_err(stage_err)?;

        Ok(StagedGuide {
            temp,
            target: self.target.clone(),
            report: PublishReport {
                path: self.target.clone(),
                bytes: bytes.len() as u64,
                sha256: digest,
                channels: guide.channels.len(),
                programmes: guide.programme_count(),
                published_at: Utc::now(),
            },
        })
    }

    pub fn publish(&self, guide: &MergedGuide) -> Result<PublishReport, PublishError> {
        self.stage(guide)?.commit()
    }
}

/// A fully written guide waiting to replace the target. Dropping it without
/// committing removes the temp file.
#[derive(Debug)]
pub struct StagedGuide {
    temp: NamedTempFile,
    target: PathBuf,
    report: PublishReport,
}

impl StagedGuide {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn report(&self) -> &PublishReport {
        &self.report
    }

    pub fn commit(self) -> Result<PublishReport, PublishError> {
        let StagedGuide {
            temp,
            target,
            mut report,
        } = self;
        temp.persist(&target).map_err(|e| PublishError::Commit {
            target: target.clone(),
            source: e.error,
        })?;
        sync_parent(&target);
        report.published_at = Utc::now();
        tracing::info!(
            target: "publish",
            path = %target.display(),
            bytes = report.bytes,
            sha256 = %report.sha256,
            channels = report.channels,
            programmes = report.programmes,
            "guide published"
        );
        Ok(report)
    }
}

#[cfg(unix)]
fn set_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// Persist the rename itself; best effort.
#[cfg(unix)]
fn sync_parent(target: &Path) {
    if let Some(dir) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide::{Channel, GuideFragment, Programme};
    use crate::merge::{merge, SourcePriority};
    use chrono::{FixedOffset, TimeZone};

    fn guide(title: &str) -> MergedGuide {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let p = Programme::new(
            "c1",
            tz.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap(),
            title,
        );
        let frag = GuideFragment::succeeded(
            "s",
            vec![Channel::new("c1", "One").with_programme(p)],
            None,
            None,
        );
        merge(&[frag], &SourcePriority::default()).unwrap()
    }

    #[test]
    fn publish_writes_target_and_reports_digest() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("guide.xml");
        let report = Publisher::new(&target).publish(&guide("News")).unwrap();

        let written = fs::read(&target).unwrap();
        assert_eq!(report.bytes, written.len() as u64);
        assert_eq!(report.sha256, hex(&Sha256::digest(&written)));
        assert_eq!((report.channels, report.programmes), (1, 1));
        assert!(String::from_utf8(written).unwrap().contains("<title>News</title>"));
    }

    #[cfg(unix)]
    #[test]
    fn published_guide_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("guide.xml");
        Publisher::new(&target).publish(&guide("x")).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn dropped_stage_leaves_previous_guide() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("guide.xml");
        let publisher = Publisher::new(&target);
        publisher.publish(&guide("old")).unwrap();
        let before = fs::read(&target).unwrap();

        let staged = publisher.stage(&guide("new")).unwrap();
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());
        drop(staged);

        assert!(!temp.exists());
        assert_eq!(fs::read(&target).unwrap(), before);
    }

    #[test]
    fn target_without_file_name_is_rejected() {
        let err = Publisher::new("/").publish(&guide("x")).unwrap_err();
        assert!(matches!(err, PublishError::InvalidTarget(_)));
    }
}
