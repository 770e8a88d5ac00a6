//! Typed pipeline requests, lowered to media-engine argument lists.
//!
//! This is the one place that knows ffmpeg's flag syntax. Everything
//! upstream composes a `PipelineRequest` from validated parts and hands
//! it to `to_args()`.

use std::path::{Path, PathBuf};

/// Where the media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A media file on disk, optionally looped forever.
    File { path: PathBuf, loop_input: bool },
    /// An X display grab, e.g. display 2 at 1280x720.
    Display {
        display: u32,
        width: u32,
        height: u32,
        framerate: u32,
    },
    /// A capture device node.
    Device { path: PathBuf },
    /// Synthetic test pattern, for smoke-testing a loopback device.
    TestPattern {
        width: u32,
        height: u32,
        framerate: u32,
    },
}

/// Transformations applied between source and sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Scale { width: u32, height: u32 },
    Fps(u32),
    PixelFormat(String),
}

/// Where the media goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// A loopback video device node.
    V4l2(PathBuf),
    /// The virtual microphone FIFO, as raw PCM.
    Pipe {
        path: PathBuf,
        sample_rate: u32,
        channels: u32,
    },
    /// An encoded file.
    File(PathBuf),
}

/// One complete pipeline description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub source: Source,
    pub filters: Vec<Filter>,
    pub sink: Sink,
}

impl PipelineRequest {
    pub fn new(source: Source, sink: Sink) -> Self {
        Self {
            source,
            filters: Vec::new(),
            sink,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Lower to the media engine's argument list.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        match &self.source {
            Source::File { path, loop_input } => {
                if *loop_input {
                    args.push("-stream_loop".into());
                    args.push("-1".into());
                }
                args.push("-re".into());
                args.push("-i".into());
                args.push(path_arg(path));
            }
            Source::Display {
                display,
                width,
                height,
                framerate,
            } => {
                args.push("-f".into());
                args.push("x11grab".into());
                args.push("-video_size".into());
                args.push(format!("{}x{}", width, height));
                args.push("-framerate".into());
                args.push(framerate.to_string());
                args.push("-i".into());
                args.push(format!(":{}", display));
            }
            Source::Device { path } => {
                args.push("-f".into());
                args.push("v4l2".into());
                args.push("-i".into());
                args.push(path_arg(path));
            }
            Source::TestPattern {
                width,
                height,
                framerate,
            } => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(format!(
                    "testsrc=size={}x{}:rate={}",
                    width, height, framerate
                ));
            }
        }

        let filter_exprs: Vec<String> = self
            .filters
            .iter()
            .map(|f| match f {
                Filter::Scale { width, height } => format!("scale={}:{}", width, height),
                Filter::Fps(rate) => format!("fps={}", rate),
                Filter::PixelFormat(fmt) => format!("format={}", fmt),
            })
            .collect();
        if !filter_exprs.is_empty() {
            args.push("-vf".into());
            args.push(filter_exprs.join(","));
        }

        match &self.sink {
            Sink::V4l2(path) => {
                args.push("-f".into());
                args.push("v4l2".into());
                args.push("-pix_fmt".into());
                args.push("yuv420p".into());
                args.push(path_arg(path));
            }
            Sink::Pipe {
                path,
                sample_rate,
                channels,
            } => {
                args.push("-f".into());
                args.push("s16le".into());
                args.push("-ar".into());
                args.push(sample_rate.to_string());
                args.push("-ac".into());
                args.push(channels.to_string());
                args.push("-y".into());
                args.push(path_arg(path));
            }
            Sink::File(path) => {
                args.push("-y".into());
                args.push(path_arg(path));
            }
        }

        args
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
