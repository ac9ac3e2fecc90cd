//! File bodies produced locally: typed captures, placeholder archives and
//! the zip fallback for recordings that had no video encoder.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::{Cursor, Write};
use zip::result::ZipResult;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::capture::Frame;

pub const DEFAULT_HARMLESS_FILES: usize = 5;
pub const MAX_HARMLESS_FILES: usize = 100;

/// Timestamp used in generated file names.
pub fn stamp(now: &DateTime<Local>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

pub fn typed_capture(text: &str, now: &DateTime<Local>) -> (String, Vec<u8>) {
    let body = format!("[{}] {}\n", now.format("%Y-%m-%d %H:%M:%S"), text);
    (format!("typed_capture_{}.txt", stamp(now)), body.into_bytes())
}

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

pub fn harmless_files(count: usize, now: &DateTime<Local>) -> ZipResult<(String, Vec<u8>)> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for i in 1..=count {
        zip.start_file(format!("harmless_{i:03}.txt"), options())?;
        writeln!(zip, "Placeholder file {i} of {count}.")?;
        writeln!(zip, "Generated {}.", now.to_rfc3339())?;
        writeln!(zip, "This file contains no data of any importance.")?;
    }
    let bytes = zip.finish()?.into_inner();
    Ok((format!("harmless_files_{}.zip", stamp(now)), bytes))
}

#[derive(Serialize)]
struct FrameManifest<'a> {
    width: u32,
    height: u32,
    pixel_format: &'a str,
    fps: u32,
    frames: usize,
}

/// Pack raw frames as `frame_NNNNN.rgb` entries plus a `manifest.json`
/// describing how to interpret them.
pub fn frames_zip(frames: &[Frame], fps: u32) -> ZipResult<Vec<u8>> {
    let (width, height) = frames.first().map(|f| (f.width, f.height)).unwrap_or((0, 0));
    let manifest = FrameManifest {
        width,
        height,
        pixel_format: "rgb24",
        fps,
        frames: frames.len(),
    };

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("manifest.json", options())?;
    let json = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    zip.write_all(&json)?;

    for (i, frame) in frames.iter().enumerate() {
        zip.start_file(format!("frame_{i:05}.rgb"), options())?;
        zip.write_all(&frame.data)?;
    }
    Ok(zip.finish()?.into_inner())
}
