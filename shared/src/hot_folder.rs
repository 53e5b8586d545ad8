//! Hot-folder staging between ride cycles
//!
//! The PiMMS ingester polls one folder per controller and per camera. Before
//! each ride those folders are reset:
//!
//! - every folder gets `logs/<battery file>`, otherwise PiMMS reports battery
//!   errors
//! - every camera folder gets the output clip (sample video or the newest
//!   captured video) and the clip metadata file; without the metadata PiMMS
//!   reports a failed download and aborts
//!
//! A failure stops the folder it happened in and is reported; every other
//! folder is still processed.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HotFolderConfig;
use crate::error::{Error, Result, StagingStep};

const LOGS_DIR: &str = "logs";

/// Options for one reset pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPolicy {
    /// Delete the existing output clip first
    pub delete_original_clip: bool,

    /// Stage the canonical sample video instead of the newest capture
    pub use_sample_video: bool,

    /// Delete the captured video once it has been promoted
    pub delete_stream_source: bool,
}

/// Camera position within a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    A,
    B,
}

impl Position {
    pub const ALL: [Position; 2] = [Position::A, Position::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::A => "a",
            Position::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Controller,
    Camera,
}

/// How a camera folder's output clip was staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoStaging {
    /// Canonical sample video copied in
    Sample,

    /// Newest capture copied to the output clip
    Promoted { from: PathBuf, source_deleted: bool },

    /// Nothing to promote; the folder was otherwise staged
    NoPriorCapture,
}

/// Result of staging one folder
#[derive(Debug)]
pub enum SlotOutcome {
    /// Controller folder staged
    Controller,

    /// Camera folder staged
    Camera(VideoStaging),

    /// Staging stopped at a failing step
    Failed(Error),
}

/// Per-folder report from a reset pass
#[derive(Debug)]
pub struct SlotReport {
    pub kind: SlotKind,
    pub name: String,
    pub path: PathBuf,
    pub outcome: SlotOutcome,
}

impl SlotReport {
    pub fn is_ok(&self) -> bool {
        !matches!(self.outcome, SlotOutcome::Failed(_))
    }
}

impl fmt::Display for SlotReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            SlotOutcome::Controller => write!(f, "{}: staged", self.name),
            SlotOutcome::Camera(VideoStaging::Sample) => {
                write!(f, "{}: staged with sample video", self.name)
            }
            SlotOutcome::Camera(VideoStaging::Promoted { from, .. }) => {
                write!(f, "{}: promoted {}", self.name, from.display())
            }
            SlotOutcome::Camera(VideoStaging::NoPriorCapture) => {
                write!(f, "{}: staged, no capture to promote", self.name)
            }
            SlotOutcome::Failed(e) => write!(f, "{}: FAILED {}", self.name, e),
        }
    }
}

/// Newest file in `dir` with the given extension (case-insensitive).
///
/// Ties on modification time go to the greater path, so the choice is stable.
pub fn newest_capture(dir: &Path, extension: &str) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if !matches {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;

        let candidate = (modified, path);
        if newest.as_ref().map_or(true, |current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Resets controller and camera hot folders
#[derive(Debug, Clone)]
pub struct HotFolderSync {
    config: HotFolderConfig,
}

impl HotFolderSync {
    pub fn new(config: HotFolderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HotFolderConfig {
        &self.config
    }

    /// Folder name of a 1-based controller
    pub fn controller_folder(&self, controller: u32) -> String {
        format!("{}{}", self.config.controller_folder_prefix, controller)
    }

    /// Folder name of a camera, e.g. controller 2, row 3, position a: `2-3a`
    pub fn camera_folder(controller: u32, row: u32, position: Position) -> String {
        format!("{}-{}{}", controller, row, position.as_str())
    }

    fn source_battery(&self) -> PathBuf {
        self.config
            .source_path
            .join(LOGS_DIR)
            .join(&self.config.battery_file)
    }

    fn source_video(&self) -> PathBuf {
        self.config.source_path.join(&self.config.video_file)
    }

    fn source_video_inf(&self) -> PathBuf {
        self.config.source_path.join(&self.config.video_inf_file)
    }

    /// Reset every controller folder and its camera folders.
    ///
    /// Controllers are visited in order, each followed by its cameras
    /// (rows ascending, position a then b). Every folder gets a report.
    pub fn reset(&self, controllers: u32, rows: u32, policy: ResetPolicy) -> Vec<SlotReport> {
        info!(
            "Resetting hot folders in {} ({} controllers, {} rows, {:?})",
            self.config.base_path.display(),
            controllers,
            rows,
            policy
        );

        let mut reports = Vec::new();
        for controller in 1..=controllers {
            let name = self.controller_folder(controller);
            let path = self.config.base_path.join(&name);
            let outcome = match self.stage_controller(&path) {
                Ok(()) => SlotOutcome::Controller,
                Err(e) => SlotOutcome::Failed(e),
            };
            reports.push(self.report(SlotKind::Controller, name, path, outcome));

            for row in 1..=rows {
                for position in Position::ALL {
                    let name = Self::camera_folder(controller, row, position);
                    let path = self.config.base_path.join(&name);
                    let outcome = match self.stage_camera(&path, policy) {
                        Ok(video) => SlotOutcome::Camera(video),
                        Err(e) => SlotOutcome::Failed(e),
                    };
                    reports.push(self.report(SlotKind::Camera, name, path, outcome));
                }
            }
        }

        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        info!(
            "Hot folder reset complete: {} folders, {} failed",
            reports.len(),
            failed
        );
        reports
    }

    fn report(
        &self,
        kind: SlotKind,
        name: String,
        path: PathBuf,
        outcome: SlotOutcome,
    ) -> SlotReport {
        let report = SlotReport {
            kind,
            name,
            path,
            outcome,
        };
        if report.is_ok() {
            debug!("{}", report);
        } else {
            warn!("{}", report);
        }
        report
    }

    fn stage_controller(&self, dir: &Path) -> Result<()> {
        self.stage_battery(dir)
    }

    /// Create `logs/` and copy the battery placeholder into it
    fn stage_battery(&self, dir: &Path) -> Result<()> {
        let logs = dir.join(LOGS_DIR);
        if !logs.is_dir() {
            fs::create_dir_all(&logs)
                .map_err(|e| Error::staging(StagingStep::CreateLogsDir, &logs, e))?;
        }

        let dest = logs.join(&self.config.battery_file);
        copy(StagingStep::CopyBattery, &self.source_battery(), &dest)
    }

    fn stage_camera(&self, dir: &Path, policy: ResetPolicy) -> Result<VideoStaging> {
        self.stage_battery(dir)?;

        let capture = match newest_capture(dir, &self.config.capture_extension) {
            Ok(capture) => capture,
            Err(e) => {
                warn!("Could not scan {} for captures: {}", dir.display(), e);
                None
            }
        };

        let video = dir.join(&self.config.video_file);
        if policy.delete_original_clip {
            info!("Deleting {}", video.display());
            remove_if_present(StagingStep::DeleteOutputClip, &video)?;
        }

        let staging = if policy.use_sample_video {
            copy(StagingStep::CopySampleVideo, &self.source_video(), &video)?;
            VideoStaging::Sample
        } else if let Some(from) = capture {
            copy(StagingStep::PromoteCapture, &from, &video)?;
            if policy.delete_stream_source {
                info!("Deleting {}", from.display());
                remove_if_present(StagingStep::DeleteCapture, &from)?;
            }
            VideoStaging::Promoted {
                from,
                source_deleted: policy.delete_stream_source,
            }
        } else {
            info!(
                "No {} files to promote in {}",
                self.config.capture_extension,
                dir.display()
            );
            VideoStaging::NoPriorCapture
        };

        copy(
            StagingStep::CopyVideoInf,
            &self.source_video_inf(),
            &dir.join(&self.config.video_inf_file),
        )?;

        Ok(staging)
    }
}

/// Copy `from` over `to`
fn copy(step: StagingStep, from: &Path, to: &Path) -> Result<()> {
    info!("Copying {} to {}", from.display(), to.display());
    fs::copy(from, to).map(|_| ()).map_err(|e| {
        let path = if from.exists() { to } else { from };
        Error::staging(step, path, e)
    })
}

fn remove_if_present(step: StagingStep, path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::staging(step, path, e)),
    }
}
