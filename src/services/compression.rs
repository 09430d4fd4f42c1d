//! Gzip stage. Runs on the blocking pool and polls for cancellation between
//! chunks.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use flate2::{Compression, GzBuilder, read::MultiGzDecoder};
use tracing::info;

use crate::{
    errors::{PipelineError, PipelineResult},
    models::artifact::COMPRESSED_SUFFIX,
    services::{
        control::{CallControl, Checkpoint},
        scratch::ScratchFile,
    },
};

const CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionReport {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionReport {
    /// Compressed size as a percentage of the original.
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 100.0;
        }
        self.compressed_bytes as f64 / self.original_bytes as f64 * 100.0
    }
}

/// Gzip `input` into `input.gz`, recording the input's base name in the header.
pub async fn compress(input: &Path, control: &CallControl) -> PipelineResult<(ScratchFile, CompressionReport)> {
    let output = append_suffix(input, COMPRESSED_SUFFIX);
    let checkpoint = control.checkpoint("compress");
    let source = input.to_path_buf();

    let (file, report) = blocking(move || compress_blocking(&source, output, &checkpoint)).await?;
    info!(
        "compressed {} ({} -> {} bytes, {:.1}%)",
        input.display(),
        report.original_bytes,
        report.compressed_bytes,
        report.ratio()
    );
    Ok((file, report))
}

/// Gunzip `input` (which must end in `.gz`) next to itself, without the suffix.
pub async fn decompress(input: &Path, control: &CallControl) -> PipelineResult<(ScratchFile, u64)> {
    let output = strip_suffix(input, COMPRESSED_SUFFIX)?;
    let checkpoint = control.checkpoint("decompress");
    let source = input.to_path_buf();

    let (file, written) = blocking(move || decompress_blocking(&source, output, &checkpoint)).await?;
    info!("decompressed {} ({} bytes)", input.display(), written);
    Ok((file, written))
}

fn compress_blocking(
    input: &Path,
    output: PathBuf,
    checkpoint: &Checkpoint,
) -> PipelineResult<(ScratchFile, CompressionReport)> {
    let mut reader = File::open(input).map_err(|err| PipelineError::io("open compress input", input, err))?;
    let created = File::create(&output).map_err(|err| PipelineError::io("create compressed file", &output, err))?;
    let target = ScratchFile::new(output);

    let header_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut encoder = GzBuilder::new()
        .filename(header_name)
        .write(BufWriter::new(created), Compression::default());

    let original_bytes = copy_chunks(&mut reader, &mut encoder, checkpoint)
        .map_err(|err| err.at("compress", input))?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .map_err(|err| PipelineError::io("finish compressed file", target.path(), err))?;

    let compressed_bytes = std::fs::metadata(target.path())
        .map_err(|err| PipelineError::io("stat compressed file", target.path(), err))?
        .len();
    Ok((
        target,
        CompressionReport {
            original_bytes,
            compressed_bytes,
        },
    ))
}

fn decompress_blocking(
    input: &Path,
    output: PathBuf,
    checkpoint: &Checkpoint,
) -> PipelineResult<(ScratchFile, u64)> {
    let reader = File::open(input).map_err(|err| PipelineError::io("open compressed file", input, err))?;
    let created = File::create(&output).map_err(|err| PipelineError::io("create decompressed file", &output, err))?;
    let target = ScratchFile::new(output);

    // Concatenated members decode as one stream.
    let mut decoder = MultiGzDecoder::new(BufReader::new(reader));
    let mut writer = BufWriter::new(created);
    let written = copy_chunks(&mut decoder, &mut writer, checkpoint)
        .map_err(|err| err.at("decompress", input))?;
    writer
        .flush()
        .map_err(|err| PipelineError::io("flush decompressed file", target.path(), err))?;
    Ok((target, written))
}

enum CopyError {
    Io(io::Error),
    Interrupted(crate::services::control::Interrupted),
}

impl CopyError {
    fn at(self, operation: &'static str, path: &Path) -> PipelineError {
        match self {
            Self::Io(err) => PipelineError::io(operation, path, err),
            Self::Interrupted(err) => err.into(),
        }
    }
}

fn copy_chunks(reader: &mut impl Read, writer: &mut impl Write, checkpoint: &Checkpoint) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        checkpoint.check().map_err(CopyError::Interrupted)?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyError::Io(err)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Io)?;
        total += n as u64;
    }
}

async fn blocking<T, F>(work: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| PipelineError::io("run blocking task", PathBuf::new(), io::Error::other(err)))?
}

pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// `path` without `suffix`; an input that lacks it is rejected.
pub(crate) fn strip_suffix(path: &Path, suffix: &str) -> PipelineResult<PathBuf> {
    path.to_str()
        .and_then(|text| text.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty() && !stem.ends_with('/'))
        .map(PathBuf::from)
        .ok_or_else(|| {
            PipelineError::io(
                "derive output name",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, format!("expected a `{suffix}` file")),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use flate2::{read::GzDecoder, write::GzEncoder};

    fn gzip_member(data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes_and_names_header() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let raw = dir.path().join("rbd-img1-20260101.rbd");
        let payload: Vec<u8> = (0..3 * CHUNK + 11).map(|i| (i % 7) as u8).collect();
        std::fs::write(&raw, &payload)?;
        let control = CallControl::default();

        let (gz, report) = compress(&raw, &control).await?;
        assert_eq!(gz.path(), dir.path().join("rbd-img1-20260101.rbd.gz"));
        assert_eq!(report.original_bytes, payload.len() as u64);
        assert!(report.compressed_bytes < report.original_bytes);

        let header = GzDecoder::new(File::open(gz.path())?);
        assert_eq!(
            header.header().and_then(|h| h.filename()),
            Some(&b"rbd-img1-20260101.rbd"[..])
        );

        std::fs::remove_file(&raw)?;
        let (restored, written) = decompress(gz.path(), &control).await?;
        assert_eq!(restored.path(), raw.as_path());
        assert_eq!(written, payload.len() as u64);
        let mut back = Vec::new();
        File::open(restored.path())?.read_to_end(&mut back)?;
        assert_eq!(back, payload);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_stream_fails_and_removes_partial_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gz = dir.path().join("bad.rbd.gz");
        std::fs::write(&gz, b"definitely not gzip")?;

        let err = decompress(&gz, &CallControl::default())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!dir.path().join("bad.rbd").exists());
        Ok(())
    }

    #[tokio::test]
    async fn concatenated_members_decode_in_full() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gz = dir.path().join("multi.rbd.gz");
        let mut stream = gzip_member(b"first-half|")?;
        stream.extend(gzip_member(b"second-half")?);
        std::fs::write(&gz, &stream)?;

        let (restored, written) = decompress(&gz, &CallControl::default()).await?;

        assert_eq!(written, 22);
        assert_eq!(std::fs::read(restored.path())?, b"first-half|second-half");
        Ok(())
    }

    #[tokio::test]
    async fn trailing_garbage_after_member_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gz = dir.path().join("tail.rbd.gz");
        let mut stream = gzip_member(b"payload")?;
        stream.extend_from_slice(b"definitely not gzip");
        std::fs::write(&gz, &stream)?;

        let err = decompress(&gz, &CallControl::default()).await.err();

        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Resource));
        assert!(!dir.path().join("tail.rbd").exists());
        Ok(())
    }

    #[tokio::test]
    async fn decompress_requires_gz_suffix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("img.rbd");
        std::fs::write(&plain, b"raw")?;
        assert!(decompress(&plain, &CallControl::default()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_compress_leaves_nothing_behind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let raw = dir.path().join("img.rbd");
        std::fs::write(&raw, b"raw bytes")?;
        let control = CallControl::default();
        control.token().cancel();

        let err = compress(&raw, &control).await.err();

        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Interrupted));
        assert!(!dir.path().join("img.rbd.gz").exists());
        Ok(())
    }

    #[test]
    fn empty_input_reports_full_ratio() {
        let report = CompressionReport {
            original_bytes: 0,
            compressed_bytes: 20,
        };
        assert_eq!(report.ratio(), 100.0);
    }
}
