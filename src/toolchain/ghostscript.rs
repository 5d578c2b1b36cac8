//! # Ghostscript Toolchain
//!
//! Compressione PDF tramite il device `pdfwrite`.
//!
//! ## Template degli argomenti (`TEMPLATE_VERSION`):
//! ```text
//! <base> <lossy|lossless> -sOutputFile=OUT [<strip pre>] -f SRC [-c <DOCINFO pdfmark>]
//! ```
//! - lossless: le immagini JPEG/JPX passano invariate, nessun downsampling
//! - lossy: preset `/ebook` con downsampling bicubico a `dpi`
//!
//! Il progresso arriva su stdout (`Processing pages N through M.`, `Page K`),
//! per questo non si usa `-q`.

use super::process::{OutputChannel, ProcessRunner, ToolInvocation};
use super::progress::GhostscriptProgressTracker;
use super::{ExecutionContext, PdfToolchain, ToolchainResult};
use crate::args;
use crate::error::Result;
use crate::plan::PdfPlan;
use crate::utils::{file_label, path_arg};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

/// Bumped whenever the argument template changes shape
pub const TEMPLATE_VERSION: u32 = 2;

pub struct GhostscriptToolchain {
    runner: ProcessRunner,
}

impl GhostscriptToolchain {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    pub fn compress_args(plan: &PdfPlan, output: &Path) -> Vec<String> {
        let mut args = args![
            "-sDEVICE=pdfwrite",
            "-dNOPAUSE",
            "-dBATCH",
            "-dSAFER",
            format!("-dCompatibilityLevel={}", plan.compatibility_level),
            "-dDetectDuplicateImages=true",
            "-dCompressFonts=true",
            "-dSubsetFonts=true",
            "-dEmbedAllFonts=true",
            "-dAutoRotatePages=/None",
            "-dColorConversionStrategy=/LeaveColorUnchanged"
        ];

        if plan.lossy {
            args.extend(args![
                "-dPDFSETTINGS=/ebook",
                "-dDownsampleColorImages=true",
                "-dDownsampleGrayImages=true",
                "-dDownsampleMonoImages=true",
                "-dColorImageDownsampleType=/Bicubic",
                "-dGrayImageDownsampleType=/Bicubic",
                format!("-dColorImageResolution={}", plan.dpi),
                format!("-dGrayImageResolution={}", plan.dpi),
                format!("-dMonoImageResolution={}", plan.dpi)
            ]);
        } else {
            args.extend(args![
                "-dPassThroughJPEGImages=true",
                "-dPassThroughJPXImages=true",
                "-dDownsampleColorImages=false",
                "-dDownsampleGrayImages=false",
                "-dDownsampleMonoImages=false",
                "-dAutoFilterColorImages=false",
                "-dAutoFilterGrayImages=false",
                "-dColorImageFilter=/FlateEncode",
                "-dGrayImageFilter=/FlateEncode"
            ]);
        }

        args.push(format!("-sOutputFile={}", path_arg(output)));

        if plan.strip_metadata {
            args.extend(args![
                "-dPreserveDocInfo=false",
                "-dPreserveEPSInfo=false",
                "-dPreserveOPIComments=false",
                "-dPreserveHalftoneInfo=false"
            ]);
        }

        args.extend(args!["-f", path_arg(&plan.source)]);

        if plan.strip_metadata {
            args.extend(args![
                "-c",
                "[ /Title () /Author () /Subject () /Keywords () /Creator () /Producer () /DOCINFO pdfmark"
            ]);
        }
        args
    }
}

#[async_trait]
impl PdfToolchain for GhostscriptToolchain {
    async fn compress(&self, plan: &PdfPlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult> {
        info!(
            "📄 Compressing {} ({}, template v{})",
            file_label(&plan.source),
            if plan.lossy { "lossy" } else { "lossless" },
            TEMPLATE_VERSION
        );
        let invocation = ToolInvocation::new("gs", Self::compress_args(plan, output))
            .progress_on(OutputChannel::Stdout)
            .with_timeout(plan.timeout);
        self.runner
            .run(&invocation, Box::new(GhostscriptProgressTracker::new()), ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::plan::{OutputOptions, PdfOptions};

    fn plan(meta: Metadata) -> PdfPlan {
        PdfPlan::build(Path::new("/docs/in.pdf"), &PdfOptions::default(), &OutputOptions::default(), &meta)
    }

    #[test]
    fn test_lossless_template() {
        let args = GhostscriptToolchain::compress_args(&plan(Metadata::new()), Path::new("/tmp/out.pdf"));
        assert_eq!(args[0], "-sDEVICE=pdfwrite");
        assert!(args.contains(&"-dCompatibilityLevel=1.5".to_string()));
        assert!(args.contains(&"-dPassThroughJPEGImages=true".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-dPDFSETTINGS")));
        assert!(!args.contains(&"-q".to_string()));
        // Il file sorgente chiude la lista quando non si rimuovono i metadata
        assert_eq!(&args[args.len() - 3..], ["-sOutputFile=/tmp/out.pdf", "-f", "/docs/in.pdf"]);
    }

    #[test]
    fn test_lossy_template_uses_dpi() {
        let mut meta = Metadata::new();
        meta.insert("pdf.lossy", true);
        meta.insert("pdf.dpi", 110);
        let args = GhostscriptToolchain::compress_args(&plan(meta), Path::new("/tmp/out.pdf"));
        assert!(args.contains(&"-dPDFSETTINGS=/ebook".to_string()));
        assert!(args.contains(&"-dColorImageResolution=110".to_string()));
        assert!(!args.contains(&"-dPassThroughJPEGImages=true".to_string()));
    }

    #[test]
    fn test_strip_blocks_surround_source() {
        let mut meta = Metadata::new();
        meta.insert("pdf.strip_metadata", true);
        let args = GhostscriptToolchain::compress_args(&plan(meta), Path::new("/tmp/out.pdf"));
        let position = |needle: &str| args.iter().position(|a| a == needle).unwrap();

        assert!(position("-sOutputFile=/tmp/out.pdf") < position("-dPreserveDocInfo=false"));
        assert!(position("-dPreserveDocInfo=false") < position("-f"));
        assert_eq!(args[position("-f") + 1], "/docs/in.pdf");
        assert_eq!(args[args.len() - 2], "-c");
        assert!(args.last().unwrap().ends_with("/DOCINFO pdfmark"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compress_tracks_pages_on_stdout() {
        use crate::toolchain::process::test_support::{runner_with, write_script};
        use crate::toolchain::progress::tests::recording_reporter;
        use tempfile::TempDir;
        use tokio_util::sync::CancellationToken;

        let dir = TempDir::new().unwrap();
        let gs = write_script(
            dir.path(),
            "gs",
            r#"for a; do case "$a" in -sOutputFile=*) out="${a#-sOutputFile=}" ;; esac; done
echo "Processing pages 1 through 4."
echo "Page 1"
echo "Page 2"
echo "Page 3"
echo "Page 4"
printf '%%PDF-1.5 small' > "$out""#,
        );
        let toolchain = GhostscriptToolchain::new(runner_with(&[("gs", gs)]));
        let (reporter, events) = recording_reporter();
        let ctx = ExecutionContext::new(reporter.request_id(), CancellationToken::new(), reporter);
        let output = dir.path().join("out.pdf");

        let result = toolchain.compress(&plan(Metadata::new()), &output, &ctx).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert!(std::fs::read_to_string(&output).unwrap().starts_with("%PDF-1.5"));
        let events = events.lock().unwrap();
        let percentages: Vec<f64> = events.iter().map(|e| e.percentage).collect();
        assert_eq!(percentages, vec![25.0, 50.0, 75.0, 99.0, 100.0]);
        assert_eq!(events[1].message.as_deref(), Some("page 2 of 4"));
    }
}
