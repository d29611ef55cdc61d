use std::io::{self, Write};

use futures::future::BoxFuture;
use tokio::fs::File;

use crate::vfile::VirtualFile;

use super::{FetchError, FetchSource};

/// Copies an existing file into the destination.
///
/// Without a source file the destination is left empty, which gives callers a blank target
/// to write into.
#[derive(Debug, Clone)]
pub struct CopySource {
    source: Option<VirtualFile>,
}

impl CopySource {
    pub fn new(source: VirtualFile) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub fn empty() -> Self {
        Self { source: None }
    }

    async fn copy(&self, destination: &mut File) -> Result<(), FetchError> {
        let Some(source) = self.source.clone() else {
            tracing::debug!("No source file, leaving the destination empty");
            return Ok(());
        };
        tracing::debug!("Copying media from {:?}", source);

        // the blocking copy works on its own handle of the destination
        let mut target = destination.try_clone().await?.into_std().await;
        let copied = tokio::task::spawn_blocking(move || {
            let copied = source.with_reader(|reader| io::copy(reader, &mut target))?;
            target.flush()?;
            io::Result::Ok(copied)
        })
        .await??;

        tracing::trace!(bytes = copied, "copy finished");
        Ok(())
    }
}

impl FetchSource for CopySource {
    fn fetch<'a>(&'a self, destination: &'a mut File) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(self.copy(destination))
    }
}
