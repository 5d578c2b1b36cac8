//! # ffmpeg / gifski Toolchain
//!
//! ## Responsabilità:
//! - Costruzione deterministica degli argomenti ffmpeg a partire dal `VideoPlan`
//! - Transcodifica ordinaria con progresso da `-progress pipe:2`
//! - Export GIF animata in due stage:
//!   1. ffmpeg estrae i frame PNG in una directory temporanea privata (0-50%)
//!   2. gifski assembla la lista ordinata dei frame (50-100%)
//!
//! ## Ordine degli argomenti (transcodifica):
//! ```text
//! -hide_banner -y [-hwaccel auto] -i SRC -map_metadata -1|0 [-vf CHAIN]
//! -fpsmax FPS <encoder> <audio> [-movflags +faststart] -progress pipe:2 -nostats OUT
//! ```

use super::process::{OutputChannel, ProcessRunner, ToolInvocation};
use super::progress::{FfmpegProgressTracker, GifskiProgressTracker};
use super::{ExecutionContext, ToolchainResult, VideoToolchain};
use crate::args;
use crate::error::Result;
use crate::plan::video::format_factor;
use crate::plan::{AudioPlan, EncoderShape, VideoPlan};
use crate::utils::{file_label, path_arg};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FRAME_PATTERN: &str = "frame%05d.png";

pub struct FfmpegToolchain {
    runner: ProcessRunner,
}

impl FfmpegToolchain {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    /// Full ffmpeg argument list for the ordinary transcode
    pub fn transcode_args(plan: &VideoPlan, output: &Path) -> Vec<String> {
        let mut args = args!["-hide_banner", "-y"];
        if plan.hardware_decode {
            args.extend(args!["-hwaccel", "auto"]);
        }
        args.extend(args!["-i", path_arg(&plan.source)]);
        args.extend(args!["-map_metadata", if plan.strip_metadata { "-1" } else { "0" }]);

        if !plan.video_filters.is_empty() {
            args.extend(args!["-vf", plan.video_filters.join(",")]);
        }
        args.extend(args!["-fpsmax", plan.target_fps]);

        match plan.encoder {
            EncoderShape::Software {
                ref codec,
                crf,
                ref preset,
            } => {
                args.extend(args!["-c:v", codec, "-crf", crf]);
                if codec.starts_with("libvpx") {
                    // VP9 in modalità qualità costante richiede bitrate 0
                    args.extend(args!["-b:v", "0"]);
                } else {
                    args.extend(args!["-preset", preset, "-pix_fmt", "yuv420p"]);
                }
            }
            EncoderShape::Hardware {
                ref encoder,
                ref bitrate,
            } => {
                args.extend(args!["-c:v", encoder, "-b:v", bitrate]);
            }
        }

        match plan.audio {
            AudioPlan::Removed => args.push("-an".to_string()),
            AudioPlan::Encode {
                ref codec,
                ref bitrate,
                ref tempo,
            } => {
                args.extend(args!["-c:a", codec, "-b:a", bitrate]);
                if !tempo.is_empty() {
                    let chain: Vec<String> = tempo
                        .iter()
                        .map(|factor| format!("atempo={}", format_factor(*factor)))
                        .collect();
                    args.extend(args!["-af", chain.join(",")]);
                }
            }
        }

        if matches!(plan.output_extension.as_str(), "mp4" | "mov" | "m4v") {
            args.extend(args!["-movflags", "+faststart"]);
        }
        args.extend(args!["-progress", "pipe:2", "-nostats", path_arg(output)]);
        args
    }

    /// ffmpeg arguments extracting numbered PNG frames into `frames_dir`
    pub fn frame_extraction_args(plan: &VideoPlan, frames_dir: &Path) -> Vec<String> {
        args![
            "-hide_banner",
            "-y",
            "-i",
            path_arg(&plan.source),
            "-vf",
            plan.animation_filters().join(","),
            "-progress",
            "pipe:2",
            "-nostats",
            path_arg(&frames_dir.join(FRAME_PATTERN))
        ]
    }

    /// gifski arguments for an already sorted frame list
    pub fn gifski_args(plan: &VideoPlan, frames: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = args![
            "--fps",
            plan.animation.fps,
            "--width",
            plan.animation.width,
            "--quality",
            plan.animation.quality,
            "-o",
            path_arg(output)
        ];
        args.extend(frames.iter().map(|frame| path_arg(frame)));
        args
    }

    fn collect_frames(frames_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(frames_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("png"))
                    .unwrap_or(false)
            })
            .collect();
        // I nomi sono zero-padded: l'ordine lessicografico è l'ordine dei frame
        frames.sort();
        Ok(frames)
    }
}

#[async_trait]
impl VideoToolchain for FfmpegToolchain {
    async fn transcode(&self, plan: &VideoPlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult> {
        info!("🎬 Transcoding {} -> {}", file_label(&plan.source), file_label(output));
        let invocation = ToolInvocation::new("ffmpeg", Self::transcode_args(plan, output))
            .progress_on(OutputChannel::Stderr)
            .with_timeout(plan.timeout);
        let tracker = Box::new(FfmpegProgressTracker::new(plan.known_duration, plan.speed));
        self.runner.run(&invocation, tracker, ctx).await
    }

    async fn export_animation(
        &self,
        plan: &VideoPlan,
        output: &Path,
        ctx: &ExecutionContext,
    ) -> Result<ToolchainResult> {
        info!("🎞️  Exporting animation {} -> {}", file_label(&plan.source), file_label(output));
        let frames_dir = ctx.temp_dir("media-engine-frames-")?;

        let mut extract_ctx = ctx.clone();
        extract_ctx.progress = ctx.progress.stage(0.0, 50.0);
        let extraction = ToolInvocation::new("ffmpeg", Self::frame_extraction_args(plan, frames_dir.path()))
            .progress_on(OutputChannel::Stderr)
            .with_timeout(plan.timeout);
        let result = self
            .runner
            .run(
                &extraction,
                Box::new(FfmpegProgressTracker::new(plan.known_duration, plan.speed)),
                &extract_ctx,
            )
            .await?;
        if !result.success {
            return Ok(result);
        }

        let frames = Self::collect_frames(frames_dir.path())?;
        if frames.is_empty() {
            return Ok(ToolchainResult::failed("frame extraction produced no frames"));
        }
        debug!("Extracted {} frames for {}", frames.len(), file_label(&plan.source));
        ctx.check_cancelled()?;

        let mut assemble_ctx = ctx.clone();
        assemble_ctx.progress = ctx.progress.stage(50.0, 100.0);
        let assembly = ToolInvocation::new("gifski", Self::gifski_args(plan, &frames, output))
            .progress_on(OutputChannel::Stderr)
            .with_timeout(plan.timeout);
        self.runner
            .run(&assembly, Box::new(GifskiProgressTracker::new()), &assemble_ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::plan::{OutputOptions, VideoOptions};

    fn plan(meta: Metadata) -> VideoPlan {
        VideoPlan::build(
            Path::new("/in/clip.mp4"),
            &VideoOptions::default(),
            &OutputOptions::default(),
            &meta,
        )
    }

    #[test]
    fn test_default_transcode_args() {
        let args = FfmpegToolchain::transcode_args(&plan(Metadata::new()), Path::new("/tmp/out.mp4"));
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-y", "-i", "/in/clip.mp4", "-map_metadata", "-1", "-fpsmax", "60", "-c:v",
                "libx264", "-crf", "26", "-preset", "slow", "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a",
                "128k", "-movflags", "+faststart", "-progress", "pipe:2", "-nostats", "/tmp/out.mp4",
            ]
        );
    }

    #[test]
    fn test_transcode_args_with_filters_and_tempo() {
        let mut meta = Metadata::new();
        meta.insert("video.speed", 4);
        meta.insert("video.height", 720);
        meta.insert("video.hw_accel", true);
        meta.insert("video.strip_metadata", false);
        let args = FfmpegToolchain::transcode_args(&plan(meta), Path::new("/tmp/out.mp4"));

        let position = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert!(position("-hwaccel") < position("-i"));
        assert_eq!(args[position("-map_metadata") + 1], "0");
        assert_eq!(args[position("-vf") + 1], "setpts=PTS/4,scale=-2:'min(720,ih)'");
        assert_eq!(args[position("-af") + 1], "atempo=2,atempo=2");
        assert!(position("-vf") < position("-fpsmax"));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn test_webm_has_no_faststart_and_zero_bitrate() {
        let mut meta = Metadata::new();
        meta.insert("video.extension", "webm");
        meta.insert("video.remove_audio", true);
        let args = FfmpegToolchain::transcode_args(&plan(meta), Path::new("/tmp/out.webm"));
        assert!(!args.contains(&"-movflags".to_string()));
        assert!(args.contains(&"-an".to_string()));
        let bv = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[bv + 1], "0");
    }

    #[test]
    fn test_gifski_args_keep_frame_order() {
        let mut meta = Metadata::new();
        meta.insert("video.mode", "gif");
        let plan = plan(meta);
        let frames = vec![PathBuf::from("/f/frame00001.png"), PathBuf::from("/f/frame00002.png")];
        let args = FfmpegToolchain::gifski_args(&plan, &frames, Path::new("/tmp/out.gif"));
        assert_eq!(
            args,
            vec![
                "--fps", "15", "--width", "480", "--quality", "90", "-o", "/tmp/out.gif", "/f/frame00001.png",
                "/f/frame00002.png",
            ]
        );
    }

    #[cfg(unix)]
    mod with_fake_tools {
        use super::*;
        use crate::toolchain::process::test_support::{runner_with, write_script};
        use crate::toolchain::progress::tests::recording_reporter;
        use tempfile::TempDir;
        use tokio_util::sync::CancellationToken;

        fn fake_ffmpeg(dir: &Path, log: &Path) -> PathBuf {
            write_script(
                dir,
                "ffmpeg",
                &format!(
                    r#"for last; do :; done
echo "$@" >> '{log}'
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 900 kb/s" >&2
echo "out_time_us=5000000" >&2
echo "progress=continue" >&2
case "$last" in
  *%05d.png) d=$(dirname "$last"); printf x > "$d/frame00002.png"; printf x > "$d/frame00001.png" ;;
  *) printf encoded > "$last" ;;
esac
echo "progress=end" >&2"#,
                    log = log.display()
                ),
            )
        }

        fn fake_gifski(dir: &Path, log: &Path) -> PathBuf {
            write_script(
                dir,
                "gifski",
                &format!(
                    r#"out=""; prev=""
for a; do if [ "$prev" = "-o" ]; then out="$a"; fi; prev="$a"; done
echo "gifski $@" >> '{log}'
echo "Frame 1 / 2" >&2
echo "Frame 2 / 2" >&2
printf GIF89a > "$out""#,
                    log = log.display()
                ),
            )
        }

        #[tokio::test]
        async fn test_transcode_reports_progress() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("calls.log");
            let toolchain = FfmpegToolchain::new(runner_with(&[("ffmpeg", fake_ffmpeg(dir.path(), &log))]));
            let (reporter, events) = recording_reporter();
            let ctx = ExecutionContext::new(reporter.request_id(), CancellationToken::new(), reporter);
            let output = dir.path().join("out.mp4");

            let result = toolchain
                .transcode(&plan(Metadata::new()), &output, &ctx)
                .await
                .unwrap();

            assert!(result.success, "{:?}", result.error);
            assert_eq!(std::fs::read(&output).unwrap(), b"encoded");
            let percentages: Vec<f64> = events.lock().unwrap().iter().map(|e| e.percentage).collect();
            assert!(percentages.contains(&50.0));
            assert_eq!(*percentages.last().unwrap(), 100.0);
            assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        }

        #[tokio::test]
        async fn test_animation_extracts_then_assembles() {
            let dir = TempDir::new().unwrap();
            let temp_root = dir.path().join("scratch");
            let log = dir.path().join("calls.log");
            let toolchain = FfmpegToolchain::new(runner_with(&[
                ("ffmpeg", fake_ffmpeg(dir.path(), &log)),
                ("gifski", fake_gifski(dir.path(), &log)),
            ]));
            let (reporter, events) = recording_reporter();
            let ctx = ExecutionContext::new(reporter.request_id(), CancellationToken::new(), reporter)
                .with_temp_root(&temp_root);
            let output = dir.path().join("out.gif");

            let mut meta = Metadata::new();
            meta.insert("video.mode", "animated");
            let result = toolchain.export_animation(&plan(meta), &output, &ctx).await.unwrap();

            assert!(result.success, "{:?}", result.error);
            assert_eq!(std::fs::read(&output).unwrap(), b"GIF89a");

            let calls = std::fs::read_to_string(&log).unwrap();
            let lines: Vec<&str> = calls.lines().collect();
            assert_eq!(lines.len(), 2);
            assert!(lines[0].contains("fps=15,scale=480:-2:flags=lanczos"));
            // gifski riceve i frame in ordine
            let first = lines[1].find("frame00001.png").unwrap();
            let second = lines[1].find("frame00002.png").unwrap();
            assert!(first < second);

            // La directory dei frame viene rimossa
            assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);

            let percentages: Vec<f64> = events.lock().unwrap().iter().map(|e| e.percentage).collect();
            assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
            assert!(percentages.iter().any(|p| *p > 50.0 && *p < 100.0));
            assert_eq!(*percentages.last().unwrap(), 100.0);
        }

        #[tokio::test]
        async fn test_failed_extraction_skips_gifski() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("calls.log");
            let ffmpeg = write_script(dir.path(), "ffmpeg", "echo 'Invalid data found' >&2; exit 1");
            let toolchain = FfmpegToolchain::new(runner_with(&[
                ("ffmpeg", ffmpeg),
                ("gifski", fake_gifski(dir.path(), &log)),
            ]));
            let ctx = ExecutionContext::detached(crate::request::RequestId::new()).with_temp_root(dir.path().join("t"));

            let mut meta = Metadata::new();
            meta.insert("video.mode", "gif");
            let result = toolchain
                .export_animation(&plan(meta), &dir.path().join("out.gif"), &ctx)
                .await
                .unwrap();

            assert!(!result.success);
            assert!(result.error_message().contains("Invalid data found"));
            assert!(!log.exists());
        }
    }
}
