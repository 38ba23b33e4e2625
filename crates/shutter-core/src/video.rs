//! Video fragment assembly
//!
//! A recording is downloaded from the camera as an ordered stream of
//! fragments. The assembler is a reducer over that stream: the first fragment
//! opens an output named by the camera, every fragment appends its payload in
//! arrival order, and the last fragment (or an interruption) closes it.

use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One chunk of a video recording
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFragment {
    pub is_first: bool,
    pub is_last: bool,
    pub payload: Vec<u8>,
    /// Download progress, 0.0 - 100.0
    pub percent_complete: f32,
    /// Camera-supplied file name; only meaningful on the first fragment
    pub filename: String,
    /// Video dimensions; only meaningful on the last fragment
    pub width: u32,
    pub height: u32,
}

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("A recording to {} is already in progress", path.display())]
    AlreadyRecording { path: PathBuf },
    #[error("No recording in progress")]
    NotRecording,
    #[error("Invalid video file name: {0:?}")]
    InvalidFilename(String),
    #[error("Video output error: {0}")]
    Io(#[from] io::Error),
}

/// An output opened for one recording
pub struct OpenOutput {
    pub writer: Box<dyn Write + Send>,
    pub path: PathBuf,
}

/// Creates the sink a recording is written to
pub trait OutputProvider: Send + Sync {
    fn create(&self, filename: &str) -> Result<OpenOutput, AssemblerError>;
}

/// Writes recordings as files in one directory
#[derive(Debug, Clone)]
pub struct DirectoryOutput {
    root: PathBuf,
}

impl DirectoryOutput {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl OutputProvider for DirectoryOutput {
    fn create(&self, filename: &str) -> Result<OpenOutput, AssemblerError> {
        // Only the final component of the camera-supplied name is trusted
        let name = Path::new(filename)
            .file_name()
            .ok_or_else(|| AssemblerError::InvalidFilename(filename.to_string()))?;

        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        let file = File::create(&path)?;

        Ok(OpenOutput {
            writer: Box::new(BufWriter::new(file)),
            path,
        })
    }
}

/// Why a recording closed without its last fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "code", rename_all = "snake_case")]
pub enum InterruptReason {
    /// The camera reported an error code (buffer overrun, user stop, ...)
    Sdk(i32),
    /// The fragment stream broke protocol
    ProtocolViolation,
    /// Writing the output failed
    WriteFailed,
    /// The device was detached mid-recording
    Detached,
    /// The session was shut down mid-recording
    Shutdown,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sdk(code) => write!(f, "device error {}", code),
            Self::ProtocolViolation => write!(f, "fragment protocol violation"),
            Self::WriteFailed => write!(f, "output write failed"),
            Self::Detached => write!(f, "device detached"),
            Self::Shutdown => write!(f, "session shut down"),
        }
    }
}

/// A recording that closed normally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoCompleted {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bytes_written: u64,
}

/// A recording that was force-closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoInterrupted {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub reason: InterruptReason,
}

/// Result of accepting one fragment
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    /// The first fragment opened a new output
    Started {
        path: PathBuf,
        percent: f32,
        bytes_written: u64,
    },
    Progress {
        percent: f32,
        bytes_written: u64,
    },
    Completed(VideoCompleted),
}

struct Recording {
    writer: Box<dyn Write + Send>,
    path: PathBuf,
    bytes_written: u64,
}

/// Reassembles one device's fragment stream into a file
pub struct VideoAssembler {
    outputs: Arc<dyn OutputProvider>,
    recording: Option<Recording>,
}

impl VideoAssembler {
    pub fn new(outputs: Arc<dyn OutputProvider>) -> Self {
        Self {
            outputs,
            recording: None,
        }
    }

    /// Whether a recording is between its first and last fragment
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.recording.as_ref().map(|r| r.path.as_path())
    }

    pub fn bytes_written(&self) -> u64 {
        self.recording.as_ref().map_or(0, |r| r.bytes_written)
    }

    /// Accept the next fragment in arrival order
    ///
    /// On an I/O error the recording stays open; the caller decides whether
    /// to `interrupt` it.
    pub fn push(&mut self, fragment: &VideoFragment) -> Result<FragmentOutcome, AssemblerError> {
        let mut started = None;

        if fragment.is_first {
            if let Some(recording) = &self.recording {
                return Err(AssemblerError::AlreadyRecording {
                    path: recording.path.clone(),
                });
            }
            let output = self.outputs.create(&fragment.filename)?;
            info!(path = %output.path.display(), "Video download started");
            started = Some(output.path.clone());
            self.recording = Some(Recording {
                writer: output.writer,
                path: output.path,
                bytes_written: 0,
            });
        }

        let recording = self.recording.as_mut().ok_or(AssemblerError::NotRecording)?;
        recording.writer.write_all(&fragment.payload)?;
        recording.bytes_written += fragment.payload.len() as u64;
        let bytes_written = recording.bytes_written;
        debug!(
            percent = fragment.percent_complete,
            bytes = bytes_written,
            "Video fragment written"
        );

        if fragment.is_last {
            recording.writer.flush()?;
            if let Some(recording) = self.recording.take() {
                let completed = VideoCompleted {
                    path: recording.path,
                    width: fragment.width,
                    height: fragment.height,
                    bytes_written,
                };
                info!(
                    path = %completed.path.display(),
                    width = completed.width,
                    height = completed.height,
                    bytes = completed.bytes_written,
                    "Video saved"
                );
                return Ok(FragmentOutcome::Completed(completed));
            }
        }

        Ok(match started {
            Some(path) => FragmentOutcome::Started {
                path,
                percent: fragment.percent_complete,
                bytes_written,
            },
            None => FragmentOutcome::Progress {
                percent: fragment.percent_complete,
                bytes_written,
            },
        })
    }

    /// Force-close the open recording, if any
    pub fn interrupt(&mut self, reason: InterruptReason) -> Option<VideoInterrupted> {
        let mut recording = self.recording.take()?;
        if let Err(e) = recording.writer.flush() {
            warn!(path = %recording.path.display(), error = %e, "Failed to flush interrupted video");
        }

        let interrupted = VideoInterrupted {
            path: recording.path,
            bytes_written: recording.bytes_written,
            reason,
        };
        warn!(
            path = %interrupted.path.display(),
            bytes = interrupted.bytes_written,
            reason = %reason,
            "Video recording interrupted"
        );
        Some(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fragment(first: bool, last: bool, payload: &[u8], percent: f32) -> VideoFragment {
        VideoFragment {
            is_first: first,
            is_last: last,
            payload: payload.to_vec(),
            percent_complete: percent,
            filename: "DSC_0001.MOV".to_string(),
            width: if last { 1920 } else { 0 },
            height: if last { 1080 } else { 0 },
        }
    }

    fn assembler(dir: &TempDir) -> VideoAssembler {
        VideoAssembler::new(Arc::new(DirectoryOutput::new(dir.path())))
    }

    #[test]
    fn test_fragments_concatenate_in_order() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        let outcome = asm.push(&fragment(true, false, b"aa", 25.0)).unwrap();
        assert!(matches!(outcome, FragmentOutcome::Started { bytes_written: 2, .. }));
        assert!(asm.is_recording());

        asm.push(&fragment(false, false, b"bbb", 50.0)).unwrap();
        asm.push(&fragment(false, false, b"c", 75.0)).unwrap();
        let outcome = asm.push(&fragment(false, true, b"dd", 100.0)).unwrap();

        let path = dir.path().join("DSC_0001.MOV");
        assert_eq!(
            outcome,
            FragmentOutcome::Completed(VideoCompleted {
                path: path.clone(),
                width: 1920,
                height: 1080,
                bytes_written: 8,
            })
        );
        assert!(!asm.is_recording());
        assert_eq!(std::fs::read(path).unwrap(), b"aabbbcdd");
    }

    #[test]
    fn test_interrupt_keeps_partial_file() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        asm.push(&fragment(true, false, b"", 0.0)).unwrap();
        asm.push(&fragment(false, false, b"partial", 40.0)).unwrap();
        let interrupted = asm.interrupt(InterruptReason::Sdk(-7)).unwrap();

        assert_eq!(interrupted.reason, InterruptReason::Sdk(-7));
        assert_eq!(interrupted.bytes_written, 7);
        assert!(!asm.is_recording());
        assert_eq!(std::fs::read(&interrupted.path).unwrap(), b"partial");
    }

    #[test]
    fn test_missing_first_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        let err = asm.push(&fragment(false, false, b"x", 50.0)).unwrap_err();
        assert!(matches!(err, AssemblerError::NotRecording));
        let err = asm.push(&fragment(false, true, b"y", 100.0)).unwrap_err();
        assert!(matches!(err, AssemblerError::NotRecording));
        assert!(!dir.path().join("DSC_0001.MOV").exists());
    }

    #[test]
    fn test_late_fragment_after_close_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        asm.push(&fragment(true, false, b"a", 50.0)).unwrap();
        asm.push(&fragment(false, true, b"b", 100.0)).unwrap();
        let err = asm.push(&fragment(false, false, b"late", 100.0)).unwrap_err();
        assert!(matches!(err, AssemblerError::NotRecording));

        // The closed file is not reopened or appended to
        assert_eq!(std::fs::read(dir.path().join("DSC_0001.MOV")).unwrap(), b"ab");
    }

    #[test]
    fn test_fragment_after_interrupt_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        asm.push(&fragment(true, false, b"a", 50.0)).unwrap();
        asm.interrupt(InterruptReason::Detached).unwrap();
        assert!(asm.interrupt(InterruptReason::Detached).is_none());
        let err = asm.push(&fragment(false, true, b"b", 100.0)).unwrap_err();
        assert!(matches!(err, AssemblerError::NotRecording));
    }

    #[test]
    fn test_second_first_is_already_recording() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        asm.push(&fragment(true, false, b"a", 50.0)).unwrap();
        let err = asm.push(&fragment(true, false, b"z", 10.0)).unwrap_err();
        assert!(matches!(err, AssemblerError::AlreadyRecording { .. }));

        // The first recording is untouched
        asm.push(&fragment(false, true, b"b", 100.0)).unwrap();
        assert_eq!(std::fs::read(dir.path().join("DSC_0001.MOV")).unwrap(), b"ab");
    }

    #[test]
    fn test_single_fragment_recording() {
        let dir = TempDir::new().unwrap();
        let mut asm = assembler(&dir);

        let outcome = asm.push(&fragment(true, true, b"whole", 100.0)).unwrap();
        assert!(matches!(outcome, FragmentOutcome::Completed(_)));
        assert!(!asm.is_recording());
    }

    #[test]
    fn test_filename_is_confined_to_output_dir() {
        let dir = TempDir::new().unwrap();
        let outputs = DirectoryOutput::new(dir.path().join("videos"));

        let output = outputs.create("../../etc/DSC_0002.MOV").unwrap();
        assert_eq!(output.path, dir.path().join("videos").join("DSC_0002.MOV"));

        assert!(matches!(outputs.create(".."), Err(AssemblerError::InvalidFilename(_))));
    }
}
