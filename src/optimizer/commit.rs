//! # Output Commit
//!
//! Centralizza la validazione del candidato prodotto dal toolchain e la sua
//! copia nella posizione finale.
//!
//! ## Regole:
//! - Il candidato deve esistere e non essere vuoto
//! - Con `require_smaller_output` un candidato non strettamente più piccolo
//!   viene scartato: risultato `Succeeded` con output = sorgente ("no improvement")
//! - Path finale: `<stem>.<marker>.<ext>` accanto alla sorgente, oppure
//!   `<stem>.<ext>` in modalità replace-in-place
//! - In replace-in-place la sorgente viene rimossa solo dopo una copia riuscita
//!   e solo se il path finale è diverso
//! - In replace-in-place un file diverso dalla sorgente già presente al path
//!   finale non viene mai sovrascritto: risultato `Failed`
//! - I timestamp originali vengono copiati quando richiesto (best-effort)

use crate::error::{OptimizeError, Result};
use crate::file_manager::FileManager;
use crate::plan::OutputPolicy;
use crate::request::{OptimisationResult, RequestId};
use crate::utils::file_label;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

/// Final location of the optimised copy of `source`
pub fn final_path(source: &Path, extension: &str, policy: &OutputPolicy) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = if policy.replace_in_place {
        format!("{}.{}", stem, extension)
    } else {
        format!("{}.{}.{}", stem, policy.marker, extension)
    };
    source.with_file_name(name)
}

/// Validate `candidate` and move it into place according to `policy`
pub async fn commit(
    request_id: RequestId,
    source: &Path,
    candidate: &Path,
    extension: &str,
    policy: &OutputPolicy,
) -> Result<OptimisationResult> {
    let source_meta = fs::metadata(source).await?;
    let original_size = source_meta.len();

    let candidate_size = match fs::metadata(candidate).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(OptimizeError::Validation(
                "toolchain reported success but produced no output".to_string(),
            ))
        }
    };
    if candidate_size == 0 {
        return Err(OptimizeError::Validation("toolchain produced an empty output".to_string()));
    }

    if policy.require_smaller_output && candidate_size >= original_size {
        info!(
            "⏭️  {} not improved ({} -> {}), keeping original",
            file_label(source),
            FileManager::format_size(original_size),
            FileManager::format_size(candidate_size)
        );
        return Ok(OptimisationResult::succeeded(request_id, source.to_path_buf(), "no improvement")
            .with_sizes(original_size, original_size));
    }

    let target = final_path(source, extension, policy);
    if policy.replace_in_place && target != source && fs::try_exists(&target).await.unwrap_or(true) {
        warn!(
            "⚠️  {} already exists, not replacing {}",
            target.display(),
            file_label(source)
        );
        return Ok(OptimisationResult::failed(
            request_id,
            format!("{} already exists", file_label(&target)),
        ));
    }
    fs::copy(candidate, &target).await?;
    debug!("Committed {} -> {}", candidate.display(), target.display());

    if policy.preserve_timestamps {
        let accessed = source_meta.accessed().unwrap_or_else(|_| SystemTime::now());
        match source_meta.modified() {
            Ok(modified) => {
                if let Err(e) = set_times(&target, accessed, modified) {
                    warn!("⚠️  Could not preserve timestamps on {}: {}", target.display(), e);
                }
            }
            Err(e) => debug!("Source modification time unavailable: {}", e),
        }
    }

    if policy.replace_in_place && target != source {
        if let Err(e) = fs::remove_file(source).await {
            warn!("⚠️  Optimised copy written but {} could not be removed: {}", source.display(), e);
        }
    }

    let reduction = FileManager::calculate_reduction(original_size, candidate_size);
    let message = format!(
        "{} -> {} ({:.1}% smaller)",
        FileManager::format_size(original_size),
        FileManager::format_size(candidate_size),
        reduction
    );
    info!("✅ {}: {}", file_label(&target), message);
    Ok(OptimisationResult::succeeded(request_id, target, message).with_sizes(original_size, candidate_size))
}

fn set_times(path: &Path, accessed: SystemTime, modified: SystemTime) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OptimisationStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy(require_smaller: bool, replace: bool) -> OutputPolicy {
        OutputPolicy {
            require_smaller_output: require_smaller,
            replace_in_place: replace,
            marker: "optimised".to_string(),
            preserve_timestamps: true,
        }
    }

    #[test]
    fn test_final_path_naming() {
        let source = Path::new("/media/holiday.MOV");
        assert_eq!(
            final_path(source, "mp4", &policy(true, false)),
            PathBuf::from("/media/holiday.optimised.mp4")
        );
        assert_eq!(final_path(source, "mp4", &policy(true, true)), PathBuf::from("/media/holiday.mp4"));
    }

    #[tokio::test]
    async fn test_not_smaller_keeps_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("doc.pdf");
        let candidate = dir.path().join("candidate.pdf");
        std::fs::write(&source, vec![1u8; 100]).unwrap();
        std::fs::write(&candidate, vec![1u8; 100]).unwrap();

        let result = commit(RequestId::new(), &source, &candidate, "pdf", &policy(true, false))
            .await
            .unwrap();

        assert_eq!(result.status, OptimisationStatus::Succeeded);
        assert_eq!(result.output_path.as_deref(), Some(source.as_path()));
        assert_eq!(result.message.as_deref(), Some("no improvement"));
        assert!(!dir.path().join("doc.optimised.pdf").exists());
    }

    #[tokio::test]
    async fn test_larger_output_accepted_when_not_required_smaller() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("doc.pdf");
        let candidate = dir.path().join("candidate.pdf");
        std::fs::write(&source, vec![1u8; 10]).unwrap();
        std::fs::write(&candidate, vec![2u8; 20]).unwrap();

        let result = commit(RequestId::new(), &source, &candidate, "pdf", &policy(false, false))
            .await
            .unwrap();

        let target = dir.path().join("doc.optimised.pdf");
        assert_eq!(result.output_path.as_deref(), Some(target.as_path()));
        assert_eq!(std::fs::read(&target).unwrap().len(), 20);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_replace_in_place_removes_source_after_copy() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("clip.avi");
        let candidate = dir.path().join("candidate.mp4");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, vec![0u8; 10]).unwrap();

        let result = commit(RequestId::new(), &source, &candidate, "mp4", &policy(true, true))
            .await
            .unwrap();

        let target = dir.path().join("clip.mp4");
        assert_eq!(result.output_path.as_deref(), Some(target.as_path()));
        assert_eq!(result.original_size, Some(1000));
        assert_eq!(result.optimised_size, Some(10));
        assert!(target.exists());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_replace_refuses_to_clobber_other_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        let existing = dir.path().join("a.jpg");
        let candidate = dir.path().join("candidate.jpg");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        std::fs::write(&existing, b"someone else's photo").unwrap();
        std::fs::write(&candidate, vec![7u8; 10]).unwrap();

        let result = commit(RequestId::new(), &source, &candidate, "jpg", &policy(true, true))
            .await
            .unwrap();

        assert_eq!(result.status, OptimisationStatus::Failed);
        assert_eq!(result.message.as_deref(), Some("a.jpg already exists"));
        assert_eq!(std::fs::read(&existing).unwrap(), b"someone else's photo");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_replace_same_path_overwrites_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("photo.jpg");
        let candidate = dir.path().join("candidate.jpg");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, vec![7u8; 10]).unwrap();

        commit(RequestId::new(), &source, &candidate, "jpg", &policy(true, true))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&source).unwrap(), vec![7u8; 10]);
    }

    #[tokio::test]
    async fn test_timestamps_are_preserved() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("old.png");
        let candidate = dir.path().join("candidate.png");
        std::fs::write(&source, vec![0u8; 100]).unwrap();
        std::fs::write(&candidate, vec![0u8; 10]).unwrap();
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        set_times(&source, past, past).unwrap();

        let result = commit(RequestId::new(), &source, &candidate, "png", &policy(true, false))
            .await
            .unwrap();

        let modified = std::fs::metadata(result.output_path.unwrap()).unwrap().modified().unwrap();
        assert_eq!(modified, past);
    }

    #[tokio::test]
    async fn test_empty_or_missing_candidate_is_error() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.pdf");
        std::fs::write(&source, b"%PDF-1.4").unwrap();
        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();

        let missing = commit(RequestId::new(), &source, &dir.path().join("nope.pdf"), "pdf", &policy(true, false)).await;
        assert!(matches!(missing, Err(OptimizeError::Validation(_))));
        let empty = commit(RequestId::new(), &source, &empty, "pdf", &policy(true, false)).await;
        assert!(matches!(empty, Err(OptimizeError::Validation(_))));
    }
}
