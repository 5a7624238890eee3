//! Pose models running in a child process.
//!
//! The child reads one JSON request per line on stdin and answers with one
//! JSON line on stdout. Extraction requests carry the frame as base64 RGB:
//!
//! ```text
//! -> {"width": 640, "height": 480, "rgb": "<base64>"}
//! <- {"keypoints": [[x, y, visibility], ...]}   or   {"keypoints": null}
//! ```
//!
//! Lifting requests carry the whole 2D sequence:
//!
//! ```text
//! -> {"poses": [[[x, y], ...], ...]}
//! <- {"poses": [[[x, y, z], ...], ...]}
//! ```

use crate::{
    error::Error,
    extract::{ExtractorFactory, KeypointExtractor, Pose3d, PoseLifter},
    frame::Frame,
    pose::{Keypoint, KeypointSet},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};
use tracing::{debug, warn};

pub struct ProcessBridge {
    program: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl ProcessBridge {
    /// Spawn `command[0]` with the remaining elements as arguments.
    pub fn spawn(command: &[String]) -> Result<Self, Error> {
        let (program, args) = command.split_first().ok_or(Error::EmptyBridgeCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::SpawnBridge(e, program.clone()))?;

        let stdin = child.stdin.take().ok_or(Error::BridgeClosed)?;
        let stdout = child.stdout.take().ok_or(Error::BridgeClosed)?;
        debug!(program = %program, pid = child.id(), "spawned bridge");

        Ok(Self {
            program: program.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    pub fn request<Req, Resp>(&mut self, request: &Req) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        serde_json::to_writer(&mut self.stdin, request).map_err(Error::BridgeProtocol)?;
        self.stdin.write_all(b"\n").map_err(Error::BridgeIo)?;
        self.stdin.flush().map_err(Error::BridgeIo)?;

        self.line.clear();
        let n = self
            .stdout
            .read_line(&mut self.line)
            .map_err(Error::BridgeIo)?;
        if n == 0 {
            return Err(Error::BridgeClosed);
        }
        serde_json::from_str(&self.line).map_err(Error::BridgeProtocol)
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(program = %self.program, error = %e, "bridge already exited");
        }
        if let Err(e) = self.child.wait() {
            warn!(program = %self.program, error = %e, "failed to reap bridge");
        }
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    width: u32,
    height: u32,
    rgb: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    keypoints: Option<Vec<Vec<f32>>>,
}

fn to_keypoint(coords: &[f32]) -> Result<Keypoint, Error> {
    match *coords {
        [x, y] => Keypoint::new(x, y, None),
        [x, y, visibility] => Keypoint::new(x, y, Some(visibility)),
        _ => Err(Error::KeypointArity(coords.len())),
    }
}

pub struct ProcessExtractor {
    bridge: ProcessBridge,
}

impl ProcessExtractor {
    pub fn new(bridge: ProcessBridge) -> Self {
        Self { bridge }
    }
}

impl KeypointExtractor for ProcessExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, Error> {
        let size = frame.size();
        let bytes: Vec<u8> = frame.pixels().iter().copied().collect();
        let rgb = STANDARD.encode(bytes);
        let response: ExtractResponse = self.bridge.request(&ExtractRequest {
            width: size.width,
            height: size.height,
            rgb: &rgb,
        })?;

        response
            .keypoints
            .filter(|points| !points.is_empty())
            .map(|points| {
                points
                    .iter()
                    .map(|coords| to_keypoint(coords))
                    .collect::<Result<Vec<_>, _>>()
                    .map(KeypointSet::new)
            })
            .transpose()
    }
}

/// Spawns one extractor process per video or session.
#[derive(Debug, Clone)]
pub struct ProcessExtractorFactory {
    command: Vec<String>,
}

impl ProcessExtractorFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ExtractorFactory for ProcessExtractorFactory {
    fn create(&self) -> Result<Box<dyn KeypointExtractor>, Error> {
        Ok(Box::new(ProcessExtractor::new(ProcessBridge::spawn(
            &self.command,
        )?)))
    }
}

#[derive(Serialize)]
struct LiftRequest {
    poses: Vec<Vec<[f32; 2]>>,
}

#[derive(Deserialize)]
struct LiftResponse {
    poses: Vec<Pose3d>,
}

pub struct ProcessLifter {
    bridge: ProcessBridge,
}

impl ProcessLifter {
    pub fn new(bridge: ProcessBridge) -> Self {
        Self { bridge }
    }
}

impl PoseLifter for ProcessLifter {
    fn lift(&mut self, poses: &[KeypointSet]) -> Result<Vec<Pose3d>, Error> {
        let request = LiftRequest {
            poses: poses
                .iter()
                .map(|pose| pose.iter().map(|k| [k.x(), k.y()]).collect())
                .collect(),
        };
        let response: LiftResponse = self.bridge.request(&request)?;
        Ok(response.poses)
    }
}
