//! # Video Optimiser
//!
//! ## Flusso:
//! 1. Applicabilità: sorgente esistente, container tra quelli leggibili
//! 2. `VideoPlan::build` con Options statiche + metadata della richiesta
//! 3. Transcodifica ordinaria oppure export GIF animata (trigger `video.mode`)
//!    in una directory temporanea privata
//! 4. Commit del candidato secondo la `OutputPolicy`

use super::{candidate_path, commit, missing_source, Optimiser};
use crate::error::Result;
use crate::plan::{source_extension, OutputOptions, VideoMode, VideoOptions, VideoPlan};
use crate::request::{ItemType, OptimisationRequest, OptimisationResult};
use crate::toolchain::{ExecutionContext, VideoToolchain};
use crate::utils::file_label;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Containers ffmpeg is expected to demux
const READABLE_CONTAINERS: &[&str] = &[
    "mp4", "mov", "m4v", "mkv", "webm", "avi", "mpg", "mpeg", "wmv", "flv", "3gp", "ts", "mts", "m2ts",
];

pub struct VideoOptimiser {
    options: VideoOptions,
    output: OutputOptions,
    toolchain: Arc<dyn VideoToolchain>,
}

impl VideoOptimiser {
    pub fn new(options: VideoOptions, output: OutputOptions, toolchain: Arc<dyn VideoToolchain>) -> Self {
        Self {
            options,
            output,
            toolchain,
        }
    }
}

#[async_trait]
impl Optimiser for VideoOptimiser {
    fn name(&self) -> &'static str {
        "video"
    }

    fn item_type(&self) -> ItemType {
        ItemType::Video
    }

    async fn optimise(&self, request: &OptimisationRequest, ctx: &ExecutionContext) -> Result<OptimisationResult> {
        let started = Instant::now();
        let id = request.id();
        let source = request.source();

        if let Some(failed) = missing_source(request).await {
            return Ok(failed);
        }
        match source_extension(source) {
            Some(ext) if READABLE_CONTAINERS.contains(&ext.as_str()) => {}
            other => {
                return Ok(OptimisationResult::unsupported(
                    id,
                    format!("unsupported video container: {}", other.unwrap_or_else(|| "none".to_string())),
                ))
            }
        }
        ctx.check_cancelled()?;

        let plan = VideoPlan::build(source, &self.options, &self.output, request.metadata());
        debug!(
            "Video plan for {}: {:?}, {} fps, .{}",
            file_label(source),
            plan.mode,
            plan.target_fps,
            plan.output_extension
        );

        let workdir = ctx.temp_dir("media-engine-video-")?;
        let candidate = candidate_path(workdir.path(), &plan.output_extension);
        let outcome = match plan.mode {
            VideoMode::Transcode => self.toolchain.transcode(&plan, &candidate, ctx).await?,
            VideoMode::AnimatedExport => self.toolchain.export_animation(&plan, &candidate, ctx).await?,
        };
        if !outcome.success {
            warn!("❌ Video optimisation failed for {}: {}", file_label(source), outcome.error_message());
            return Ok(OptimisationResult::failed(id, outcome.error_message()).with_duration(started.elapsed()));
        }
        ctx.check_cancelled()?;

        let result = commit::commit(id, source, &candidate, &plan.output_extension, &plan.output).await?;
        Ok(result.with_duration(started.elapsed()))
    }
}
