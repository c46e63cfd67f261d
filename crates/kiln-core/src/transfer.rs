//! Cancellable download into a local file.

use crate::collab::BoxReader;
use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Copy `reader` into a new file at `dest` and return the bytes written.
///
/// The copy runs on its own task and races the cancellation token. Either
/// way the copy stops, the partial file is removed: cancellation returns
/// [`BuildError::TransferInterrupted`], a failed copy its I/O error.
pub async fn copy_to_file(
    mut reader: BoxReader,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut file = File::create(dest).await?;
    let mut copy = tokio::spawn(async move {
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok::<_, std::io::Error>(written)
    });

    tokio::select! {
        joined = &mut copy => {
            let outcome = joined.map_err(|e| {
                BuildError::Io(std::io::Error::other(format!("copy task failed: {e}")))
            });
            match outcome {
                Ok(Ok(written)) => Ok(written),
                Ok(Err(e)) => {
                    remove_partial(dest).await;
                    Err(e.into())
                }
                Err(e) => {
                    remove_partial(dest).await;
                    Err(e)
                }
            }
        }
        _ = cancel.cancelled() => {
            copy.abort();
            // Wait for the task to drop the file handle before removing it.
            let _ = copy.await;
            remove_partial(dest).await;
            tracing::warn!(path = %dest.display(), "Transfer interrupted");
            Err(BuildError::TransferInterrupted(PathBuf::from(dest)))
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_copy_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.tmp");

        let written = copy_to_file(
            Box::new(std::io::Cursor::new(vec![1u8; 4096])),
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(written, 4096);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.tmp");
        // The writer half is kept alive so the reader never reaches EOF.
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = copy_to_file(Box::new(reader), &dest, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::TransferInterrupted(_)));
        assert!(err.is_cancelled());
        assert!(!dest.exists());
    }
}
