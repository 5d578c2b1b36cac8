//! # Video Plan
//!
//! Costruisce il `VideoPlan` a partire da `VideoOptions` e dai metadata della
//! richiesta.
//!
//! ## Responsabilità:
//! - Frame rate: override > default, con floor a `min_fps` e cap a `max_fps`
//! - Filtri derivati: `setpts` per la velocità, `scale` per le dimensioni massime
//! - Forma dell'encoder: software (CRF + preset) o hardware (encoder + bitrate)
//! - Audio: rimosso, oppure ricodificato con catena `atempo` per la velocità
//! - Sotto-modalità GIF animata quando `video.mode` corrisponde a un trigger
//!   (case-insensitive)
//!
//! ## Chiavi metadata (prefisso `video.`, fallback senza prefisso):
//! `mode`, `fps`, `width`, `height`, `speed`, `crf`, `preset`, `extension`,
//! `remove_audio`, `strip_metadata`, `hw_accel`, `duration`, `gif_fps`,
//! `gif_width`, `gif_quality`

use super::{normalise_extension, source_extension, OutputOptions, OutputPolicy};
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FAMILY: &str = "video";

/// Containers ffmpeg can write with the codecs chosen below
const WRITABLE_CONTAINERS: &[&str] = &["mp4", "mov", "m4v", "mkv", "webm"];

const MIN_SPEED: f64 = 0.25;
const MAX_SPEED: f64 = 16.0;
/// gifski refuses frame rates above 50
const MAX_GIF_FPS: u32 = 50;

/// Static video settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    /// Constant Rate Factor for software encoding (lower = better quality)
    pub crf: u8,
    pub preset: String,
    pub codec: String,
    pub audio_bitrate: String,
    pub target_fps: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Playback speed factor (1.0 = unchanged)
    pub speed: f64,
    pub remove_audio: bool,
    pub strip_metadata: bool,
    pub hardware_acceleration: bool,
    pub hardware_encoder: String,
    pub hardware_bitrate: String,
    /// Always write this container, whatever the source was
    pub forced_container: Option<String>,
    pub default_extension: String,
    /// `video.mode` values selecting the animated GIF export (case-insensitive)
    pub animation_triggers: Vec<String>,
    pub gif_fps: u32,
    pub gif_width: u32,
    pub gif_quality: u8,
    pub require_smaller_output: bool,
    pub timeout_secs: Option<u64>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            crf: 26,
            preset: "slow".to_string(),
            codec: "libx264".to_string(),
            audio_bitrate: "128k".to_string(),
            target_fps: 60,
            min_fps: 10,
            max_fps: 120,
            max_width: None,
            max_height: None,
            speed: 1.0,
            remove_audio: false,
            strip_metadata: true,
            hardware_acceleration: false,
            hardware_encoder: default_hardware_encoder().to_string(),
            hardware_bitrate: "6M".to_string(),
            forced_container: None,
            default_extension: "mp4".to_string(),
            animation_triggers: vec!["gif".to_string(), "animated".to_string(), "animation".to_string()],
            gif_fps: 15,
            gif_width: 480,
            gif_quality: 90,
            require_smaller_output: true,
            timeout_secs: None,
        }
    }
}

fn default_hardware_encoder() -> &'static str {
    if cfg!(target_os = "macos") {
        "h264_videotoolbox"
    } else if cfg!(windows) {
        "h264_qsv"
    } else {
        "h264_nvenc"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    Transcode,
    AnimatedExport,
}

/// Argument shape of the video encoder
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderShape {
    Software { codec: String, crf: u8, preset: String },
    Hardware { encoder: String, bitrate: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioPlan {
    Removed,
    Encode {
        codec: String,
        bitrate: String,
        /// `atempo` factors whose product is the playback speed
        tempo: Vec<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationSettings {
    pub fps: u32,
    pub width: u32,
    pub quality: u8,
}

/// Immutable execution plan for one video request
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPlan {
    pub source: PathBuf,
    pub mode: VideoMode,
    pub target_fps: u32,
    pub speed: f64,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Filter chain for the ordinary transcode, in application order
    pub video_filters: Vec<String>,
    pub encoder: EncoderShape,
    pub hardware_decode: bool,
    pub audio: AudioPlan,
    pub strip_metadata: bool,
    pub output_extension: String,
    /// Source duration in seconds when the caller already knows it
    pub known_duration: Option<f64>,
    pub animation: AnimationSettings,
    pub output: OutputPolicy,
    pub timeout: Option<Duration>,
}

impl VideoPlan {
    pub fn build(
        source: &Path,
        options: &VideoOptions,
        output_options: &OutputOptions,
        metadata: &Metadata,
    ) -> Self {
        let mode = match metadata.get_str(FAMILY, "mode") {
            Some(value)
                if options
                    .animation_triggers
                    .iter()
                    .any(|trigger| trigger.eq_ignore_ascii_case(value.trim())) =>
            {
                VideoMode::AnimatedExport
            }
            _ => VideoMode::Transcode,
        };

        let min_fps = options.min_fps.max(1);
        let max_fps = options.max_fps.max(min_fps);
        let target_fps = metadata
            .get_u32(FAMILY, "fps")
            .unwrap_or(options.target_fps)
            .clamp(min_fps, max_fps);

        let speed = metadata
            .get_f64(FAMILY, "speed")
            .filter(|s| *s > 0.0)
            .unwrap_or(options.speed);
        let speed = if speed.is_finite() && speed > 0.0 {
            speed.clamp(MIN_SPEED, MAX_SPEED)
        } else {
            1.0
        };

        let max_width = metadata.get_u32(FAMILY, "width").or(options.max_width).filter(|w| *w > 0);
        let max_height = metadata.get_u32(FAMILY, "height").or(options.max_height).filter(|h| *h > 0);

        let output_extension = match mode {
            VideoMode::AnimatedExport => "gif".to_string(),
            VideoMode::Transcode => derive_extension(source, options, metadata),
        };

        let hardware = metadata
            .get_bool(FAMILY, "hw_accel")
            .unwrap_or(options.hardware_acceleration);
        // Gli encoder hardware producono solo H.264/HEVC, non ammessi in webm
        let hardware = hardware && output_extension != "webm";
        let encoder = if hardware {
            EncoderShape::Hardware {
                encoder: options.hardware_encoder.clone(),
                bitrate: options.hardware_bitrate.clone(),
            }
        } else {
            let codec = software_codec(&output_extension, &options.codec);
            let max_crf = if codec.starts_with("libvpx") { 63 } else { 51 };
            let crf = metadata
                .get_u32(FAMILY, "crf")
                .map(|c| c.min(max_crf) as u8)
                .unwrap_or(options.crf)
                .min(max_crf as u8);
            EncoderShape::Software {
                codec,
                crf,
                preset: metadata
                    .get_str(FAMILY, "preset")
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| options.preset.clone()),
            }
        };

        let remove_audio = metadata
            .get_bool(FAMILY, "remove_audio")
            .unwrap_or(options.remove_audio);
        let audio = if remove_audio {
            AudioPlan::Removed
        } else {
            AudioPlan::Encode {
                codec: if output_extension == "webm" { "libopus" } else { "aac" }.to_string(),
                bitrate: options.audio_bitrate.clone(),
                tempo: atempo_chain(speed),
            }
        };

        let mut video_filters = Vec::new();
        if let Some(setpts) = setpts_filter(speed) {
            video_filters.push(setpts);
        }
        if let Some(scale) = scale_filter(max_width, max_height) {
            video_filters.push(scale);
        }

        let gif_fps = metadata
            .get_u32(FAMILY, "gif_fps")
            .unwrap_or(options.gif_fps)
            .clamp(1, MAX_GIF_FPS)
            .min(target_fps);
        let gif_width = metadata
            .get_u32(FAMILY, "gif_width")
            .or(max_width)
            .unwrap_or(options.gif_width)
            .max(16);
        let gif_quality = metadata
            .get_u32(FAMILY, "gif_quality")
            .map(|q| q.min(100) as u8)
            .unwrap_or(options.gif_quality)
            .clamp(1, 100);

        Self {
            source: source.to_path_buf(),
            mode,
            target_fps,
            speed,
            max_width,
            max_height,
            video_filters,
            encoder,
            hardware_decode: hardware,
            audio,
            strip_metadata: metadata
                .get_bool(FAMILY, "strip_metadata")
                .unwrap_or(options.strip_metadata),
            output_extension,
            known_duration: metadata.get_f64(FAMILY, "duration").filter(|d| *d > 0.0),
            animation: AnimationSettings {
                fps: gif_fps,
                width: gif_width,
                quality: gif_quality,
            },
            output: OutputPolicy::resolve(FAMILY, output_options, options.require_smaller_output, metadata),
            timeout: options.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Filter chain used when extracting frames for the animated export
    pub fn animation_filters(&self) -> Vec<String> {
        let mut filters = Vec::new();
        if let Some(setpts) = setpts_filter(self.speed) {
            filters.push(setpts);
        }
        filters.push(format!("fps={}", self.animation.fps));
        filters.push(format!("scale={}:-2:flags=lanczos", self.animation.width));
        filters
    }
}

/// explicit override -> forced container -> source extension -> default
fn derive_extension(source: &Path, options: &VideoOptions, metadata: &Metadata) -> String {
    let writable = |ext: &String| WRITABLE_CONTAINERS.contains(&ext.as_str());

    metadata
        .get_str(FAMILY, "extension")
        .and_then(|ext| normalise_extension(&ext))
        .filter(writable)
        .or_else(|| {
            options
                .forced_container
                .as_deref()
                .and_then(normalise_extension)
                .filter(writable)
        })
        .or_else(|| source_extension(source).filter(writable))
        .or_else(|| normalise_extension(&options.default_extension).filter(writable))
        .unwrap_or_else(|| "mp4".to_string())
}

fn software_codec(extension: &str, configured: &str) -> String {
    if extension == "webm" {
        // Il container webm accetta solo VP8/VP9/AV1
        if configured.starts_with("libvpx") || configured.contains("av1") {
            configured.to_string()
        } else {
            "libvpx-vp9".to_string()
        }
    } else {
        configured.to_string()
    }
}

fn setpts_filter(speed: f64) -> Option<String> {
    if (speed - 1.0).abs() < f64::EPSILON {
        None
    } else {
        Some(format!("setpts=PTS/{}", format_factor(speed)))
    }
}

fn scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (Some(w), Some(h)) => Some(format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
            w, h
        )),
        (Some(w), None) => Some(format!("scale='min({},iw)':-2", w)),
        (None, Some(h)) => Some(format!("scale=-2:'min({},ih)'", h)),
        (None, None) => None,
    }
}

/// Split a speed factor into `atempo` steps within [0.5, 2.0]
fn atempo_chain(speed: f64) -> Vec<f64> {
    let mut remaining = speed;
    let mut chain = Vec::new();
    while remaining > 2.0 {
        chain.push(2.0);
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        chain.push(0.5);
        remaining /= 0.5;
    }
    if (remaining - 1.0).abs() > f64::EPSILON {
        chain.push(remaining);
    }
    chain
}

/// Compact factor formatting: `1.5`, `2`, `0.75`
pub(crate) fn format_factor(value: f64) -> String {
    let formatted = format!("{:.4}", value);
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}
