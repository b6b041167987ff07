//! Incremental ZIP output.
//!
//! [`ArchiveStreamer`] serializes [`ArchiveEntry`]s into a ZIP container
//! written straight to a transport (any [`AsyncWrite`]) as entries arrive. The
//! archive is never buffered as a whole: each entry is compressed in memory,
//! then its local header and data are written immediately. Sizes and CRC are
//! known before the header goes out, so the transport never needs to seek.
//!
//! The handle is scoped: [`ArchiveStreamer::begin`] takes ownership of the
//! transport, [`ArchiveStreamer::append`] takes `&mut self` (so appends are
//! serialized by construction), and [`ArchiveStreamer::finalize`] consumes
//! the handle. Dropping it without finalizing abandons the archive; the
//! transport then sees a truncated stream, which readers must treat as a
//! failure.

use crate::{ArchiveEntry, Error, Result, naming::EntryNamer};
use async_zip::{Compression, ZipEntryBuilder, tokio::write::ZipFileWriter};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct ArchiveStreamer<W: AsyncWrite + Unpin> {
    writer: ZipFileWriter<W>,
    namer: EntryNamer,
    compression: Compression,
    appended: usize,
}

impl<W: AsyncWrite + Unpin> ArchiveStreamer<W> {
    /// Opens an archive on `transport`. Nothing is written until the first
    /// append (or finalize, for an empty archive).
    pub fn begin(transport: W) -> Self {
        Self {
            writer: ZipFileWriter::with_tokio(transport),
            namer: EntryNamer::new(),
            compression: Compression::Deflate,
            appended: 0,
        }
    }

    /// Stores entries without compression. Useful when the payloads are
    /// already compressed and CPU time matters more than a few bytes.
    #[must_use]
    pub fn stored(mut self) -> Self {
        self.compression = Compression::Stored;
        self
    }

    /// Writes one entry, resolving its name against the entries already in
    /// this archive. Returns the name actually used.
    ///
    /// May suspend while the transport applies backpressure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the transport fails or was closed. The
    /// archive must then be abandoned, not finalized.
    pub async fn append(&mut self, entry: ArchiveEntry) -> Result<String> {
        let name = self.namer.assign(&entry.name);
        let builder = ZipEntryBuilder::new(name.clone().into(), self.compression);

        self.writer
            .write_entry_whole(builder, &entry.content)
            .await?;
        self.appended += 1;

        tracing::trace!(entry = %name, bytes = entry.content.len(), "Appended archive entry");
        Ok(name)
    }

    /// Number of entries appended so far.
    pub const fn len(&self) -> usize {
        self.appended
    }

    pub const fn is_empty(&self) -> bool {
        self.appended == 0
    }

    /// Writes the central directory, flushes and shuts the transport down.
    /// Returns the number of entries in the archive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the trailer cannot be written.
    pub async fn finalize(self) -> Result<usize> {
        let mut transport = self.writer.close().await?.into_inner();
        transport
            .shutdown()
            .await
            .map_err(|e| Error::transport(format!("failed to close archive transport: {e}")))?;

        tracing::trace!(entries = self.appended, "Archive finalized");
        Ok(self.appended)
    }
}
