use std::{
    cmp,
    error::Error as StdError,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use crc32fast::Hasher;
use futures_core::Stream;
use log::{debug, trace, warn};
use reqwest::{
    header::{CONTENT_RANGE, HeaderMap},
    Response, StatusCode,
};
use thiserror::Error;
use tokio::task::{self, JoinError};
use tokio_stream::StreamExt;

use crate::{
    constants::BINARY_DOWNLOAD_ENDPOINT,
    crypto::{AES_BLOCK_SIZE, CryptoError, FirmwareCipher},
    metadata::FirmwareMetadata,
    session::{FusRequest, FusSession, Host, ProtocolError},
};

/// Default number of bytes decrypted and written at a time
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Resume offset {offset} is past the end of the {expected} byte file")]
    Overflow {
        offset: u64,
        expected: u64,
    },
    #[error("Block size {0} is not a non-zero multiple of the cipher block size")]
    InvalidBlockSize(usize),
    #[error("Unexpected HTTP status {status} for {url} at offset {offset}")]
    BadStatus {
        url: String,
        status: u16,
        offset: u64,
    },
    #[error("Server did not provide the download size for {url} at offset {offset}")]
    MissingContentLength {
        url: String,
        offset: u64,
    },
    #[error("Download ended at offset {offset}, but expected {expected} bytes")]
    UnexpectedEof {
        offset: u64,
        expected: u64,
    },
    #[error("Failed to receive data at offset {offset}: {source}")]
    Stream {
        offset: u64,
        #[source]
        source: BoxError,
    },
    #[error("I/O error on {path:?} at offset {offset}: {source}")]
    Io {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to decrypt block at offset {offset}: {source}")]
    Crypto {
        offset: u64,
        #[source]
        source: CryptoError,
    },
    #[error("Transfer cancelled at offset {offset}")]
    Cancelled {
        offset: u64,
    },
    #[error("File I/O task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Non-fatal problems detected during a transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Warning {
    /// The server reported a different size than the metadata
    SizeMismatch {
        declared: u64,
        actual: u64,
    },
    /// The CRC32 of the ciphertext does not match the metadata
    Integrity {
        expected: [u8; 4],
        actual: [u8; 4],
    },
    /// The body did not cover the whole file, so it could not be checksummed
    /// while decrypting
    ChecksumUnavailable,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { declared, actual } => write!(
                f, "Server reported {actual} bytes, but metadata declares {declared} bytes"),
            Self::Integrity { expected, actual } => write!(
                f, "Firmware's checksum ({:08X}) does not match expected checksum ({:08X})",
                u32::from_be_bytes(*actual), u32::from_be_bytes(*expected)),
            Self::ChecksumUnavailable => f.write_str(
                "Checksum cannot be verified for a partially downloaded encrypted file"),
        }
    }
}

/// Receives progress notifications from a transfer. All methods are called
/// from the task driving the transfer.
pub trait TransferObserver {
    /// Called once before any data is written.
    fn on_start(&mut self, _offset: u64, _total: u64) {}

    /// Called after each block is written with the number of ciphertext bytes
    /// it covered.
    fn on_progress(&mut self, bytes: u64);

    fn on_warning(&mut self, _warning: &Warning) {}

    /// Polled between blocks. Returning true stops the transfer.
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TransferOptions {
    /// Continue from the current length of the destination file
    pub resume: bool,
    /// Decrypt the firmware while it is being downloaded
    pub decrypt_inline: bool,
    /// Compare the CRC32 of the ciphertext against the metadata
    pub verify_checksum: bool,
    /// Number of bytes processed per block
    pub block_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            resume: true,
            decrypt_inline: false,
            verify_checksum: true,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

fn validate_block_size(block_size: usize, decrypt: bool) -> Result<(), TransferError> {
    if block_size == 0 || (decrypt && block_size % AES_BLOCK_SIZE != 0) {
        return Err(TransferError::InvalidBlockSize(block_size));
    }

    Ok(())
}

/// How the server answered a (possibly ranged) download request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeReply {
    /// HTTP 206: the body starts at the requested offset
    Partial {
        remaining: u64,
    },
    /// HTTP 200: the range was ignored and the body is the whole file
    Full {
        total: u64,
    },
    /// HTTP 416: nothing left to send
    Unsatisfiable {
        total: Option<u64>,
    },
}

impl RangeReply {
    /// Interpret the reply to a download request for `offset`.
    pub fn from_response(response: &Response, offset: u64) -> Result<Self, TransferError> {
        Self::from_parts(response.url().as_str(), offset, response.status(),
                         response.content_length(), response.headers())
    }

    fn from_parts(
        url: &str,
        offset: u64,
        status: StatusCode,
        content_length: Option<u64>,
        headers: &HeaderMap,
    ) -> Result<Self, TransferError> {
        let missing_length = || TransferError::MissingContentLength {
            url: url.to_owned(),
            offset,
        };

        match status {
            StatusCode::PARTIAL_CONTENT => Ok(Self::Partial {
                remaining: content_length.ok_or_else(missing_length)?,
            }),
            StatusCode::OK => Ok(Self::Full {
                total: content_length.ok_or_else(missing_length)?,
            }),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Self::Unsatisfiable {
                total: headers.get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().strip_prefix("bytes */"))
                    .and_then(|v| v.parse().ok()),
            }),
            s => Err(TransferError::BadStatus {
                url: url.to_owned(),
                status: s.as_u16(),
                offset,
            }),
        }
    }
}

/// Summary of a completed transfer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferReport {
    /// Offset the transfer resumed from
    pub start_offset: u64,
    /// Size of the encrypted file
    pub total: u64,
    /// Number of body bytes received from the server
    pub bytes_received: u64,
    /// Number of blocks written
    pub blocks: u64,
    /// CRC32 of the encrypted file, if it was computed
    pub checksum: Option<[u8; 4]>,
    pub warnings: Vec<Warning>,
}

/// Run blocking file work on tokio's blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f).await?
}

/// Block writer shared by the download and local decryption paths.
struct BlockSink {
    file: File,
    path: PathBuf,
    cipher: Option<FirmwareCipher>,
}

impl BlockSink {
    fn io_error(&self, offset: u64) -> impl FnOnce(io::Error) -> TransferError + '_ {
        move |source| TransferError::Io {
            path: self.path.clone(),
            offset,
            source,
        }
    }

    /// Decrypt (if needed) and write a block at its offset. Returns the offset
    /// just past the written data.
    fn write_block(&mut self, offset: u64, buf: &mut [u8], last: bool) -> Result<u64, TransferError> {
        let len = match &self.cipher {
            Some(c) if last => c.decrypt_final(buf),
            Some(c) => c.decrypt_blocks(buf).map(|_| buf.len()),
            None => Ok(buf.len()),
        }.map_err(|source| TransferError::Crypto { offset, source })?;

        trace!("Writing {len} bytes at offset {offset}");

        self.file.seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&buf[..len]))
            .map_err(self.io_error(offset))?;

        Ok(offset + len as u64)
    }

    fn finish(self, len: u64) -> Result<(), TransferError> {
        self.file.set_len(len)
            .and_then(|_| self.file.sync_all())
            .map_err(self.io_error(len))
    }
}

/// Downloads a firmware binary to a file, optionally decrypting and verifying
/// it along the way.
pub struct TransferPipeline<'a> {
    metadata: &'a FirmwareMetadata,
    destination: PathBuf,
    options: TransferOptions,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(
        metadata: &'a FirmwareMetadata,
        destination: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        Self {
            metadata,
            destination: destination.into(),
            options,
        }
    }

    /// Offset that the download will start from. This is the length of the
    /// destination file when resuming, rounded down to a cipher block boundary
    /// when decrypting.
    pub fn start_offset(&self) -> Result<u64, TransferError> {
        if !self.options.resume {
            return Ok(0);
        }

        let len = match fs::metadata(&self.destination) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(TransferError::Io {
                path: self.destination.clone(),
                offset: 0,
                source: e,
            }),
        };

        if self.options.decrypt_inline {
            Ok(len - len % AES_BLOCK_SIZE as u64)
        } else {
            Ok(len)
        }
    }

    /// Request the binary from the cloud host and stream it to the
    /// destination. The session must have been used to initialize the
    /// transfer beforehand.
    pub async fn run<O: TransferObserver + ?Sized>(
        &self,
        session: &mut FusSession,
        observer: &mut O,
    ) -> Result<TransferReport, TransferError> {
        validate_block_size(self.options.block_size, self.options.decrypt_inline)?;

        let offset = self.start_offset()?;

        debug!("Requesting {} from offset {offset}", self.metadata.file_name);

        let request = FusRequest::get(BINARY_DOWNLOAD_ENDPOINT)
            .host(Host::Cloud)
            .query(self.metadata.download_query())
            .resume_from(offset);
        let response = session.send(request).await?;
        let reply = RangeReply::from_response(&response, offset)?;

        debug!("Download reply: {reply:?}");

        self.run_source(offset, reply, response.bytes_stream(), observer).await
    }

    /// Stream `body` to the destination. `offset` is the offset that was
    /// requested and `reply` describes what the server made of it.
    pub async fn run_source<S, E, O>(
        &self,
        offset: u64,
        reply: RangeReply,
        body: S,
        observer: &mut O,
    ) -> Result<TransferReport, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
        O: TransferObserver + ?Sized,
    {
        let block_size = self.options.block_size;
        let decrypt = self.options.decrypt_inline;
        validate_block_size(block_size, decrypt)?;

        // Absolute offset of the first body byte
        let (total, body_start) = match reply {
            RangeReply::Partial { remaining } => (offset + remaining, offset),
            RangeReply::Full { total } => (total, 0),
            RangeReply::Unsatisfiable { total } => {
                let total = total.unwrap_or(self.metadata.size);
                if offset < total {
                    return Err(TransferError::BadStatus {
                        url: format!("{BINARY_DOWNLOAD_ENDPOINT}?{}",
                                     self.metadata.download_query()),
                        status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                        offset,
                    });
                }
                (total, offset)
            }
        };

        // Checked before the destination is opened for writing
        if offset > total {
            return Err(TransferError::Overflow { offset, expected: total });
        }

        let mut report = TransferReport {
            start_offset: offset,
            total,
            ..Default::default()
        };

        macro_rules! warn_user {
            ($warning:expr) => {
                {
                    let warning = $warning;
                    warn!("{warning}");
                    observer.on_warning(&warning);
                    report.warnings.push(warning);
                }
            }
        }

        if total != self.metadata.size {
            warn_user!(Warning::SizeMismatch {
                declared: self.metadata.size,
                actual: total,
            });
        }

        let destination = self.destination.clone();
        let file = blocking(move || {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(offset == 0)
                .open(&destination)
                .map_err(|source| TransferError::Io {
                    path: destination.clone(),
                    offset,
                    source,
                })
        }).await?;
        let mut sink = BlockSink {
            file,
            path: self.destination.clone(),
            cipher: decrypt.then(|| FirmwareCipher::new(&self.metadata.key)),
        };

        let verify_inline = self.options.verify_checksum && decrypt;
        let mut hasher = (verify_inline && body_start == 0 && offset < total)
            .then(Hasher::new);

        observer.on_start(offset, total);

        let mut body = Box::pin(body);
        let mut pending = Vec::with_capacity(cmp::min(block_size as u64, total - offset) as usize);
        // Absolute offset of the next body byte
        let mut pos = body_start;
        // Ciphertext offset of the start of `pending`
        let mut write_pos = offset;
        // Length of the output file
        let mut output_len = offset;

        while write_pos < total {
            if observer.is_cancelled() {
                debug!("Transfer cancelled at offset {write_pos}");
                return Err(TransferError::Cancelled { offset: write_pos });
            }

            let chunk = match body.next().await {
                Some(Ok(c)) => c,
                Some(Err(e)) => return Err(TransferError::Stream {
                    offset: pos,
                    source: e.into(),
                }),
                None => {
                    debug!("Received unexpected EOF from server");
                    return Err(TransferError::UnexpectedEof { offset: pos, expected: total });
                }
            };
            trace!("Received {} bytes", chunk.len());

            report.bytes_received += chunk.len() as u64;

            let mut data = &chunk[..cmp::min(chunk.len() as u64, total - pos) as usize];
            if data.len() < chunk.len() {
                debug!("Ignoring {} bytes past the end of the file", chunk.len() - data.len());
            }

            if let Some(h) = &mut hasher {
                h.update(data);
            }

            // Server ignored the range, so drop what is already on disk
            let skip = cmp::min(offset.saturating_sub(pos), data.len() as u64) as usize;
            data = &data[skip..];
            pos += skip as u64;

            while !data.is_empty() {
                let n = cmp::min(block_size - pending.len(), data.len());
                pending.extend_from_slice(&data[..n]);
                data = &data[n..];
                pos += n as u64;

                let block_end = write_pos + pending.len() as u64;
                let last = block_end == total;

                if pending.len() == block_size || last {
                    let mut block = mem::take(&mut pending);
                    let (s, end, b) = blocking(move || {
                        let end = sink.write_block(write_pos, &mut block, last)?;
                        Ok((sink, end, block))
                    }).await?;

                    sink = s;
                    output_len = end;
                    observer.on_progress(b.len() as u64);
                    report.blocks += 1;
                    write_pos = block_end;
                    pending = b;
                    pending.clear();
                }
            }
        }

        // The length of the plaintext is only known once the final block has
        // been unpadded
        if !(decrypt && report.blocks == 0) {
            let len = if decrypt { output_len } else { total };
            blocking(move || sink.finish(len)).await?;
        }

        if !self.options.verify_checksum {
            return Ok(report);
        }

        let checksum = if decrypt {
            match hasher {
                Some(h) => Some(h.finalize().to_be_bytes()),
                None => {
                    warn_user!(Warning::ChecksumUnavailable);
                    None
                }
            }
        } else {
            let path = self.destination.clone();
            Some(blocking(move || checksum_file(&path, block_size)).await?)
        };

        if let Some(actual) = checksum {
            debug!("Firmware checksum: {:08X}", u32::from_be_bytes(actual));

            if actual != self.metadata.crc {
                warn_user!(Warning::Integrity {
                    expected: self.metadata.crc,
                    actual,
                });
            }
        }

        report.checksum = checksum;

        Ok(report)
    }
}

/// Read exactly `buf.len()` bytes, or fewer if EOF is reached first. Returns
/// the number of bytes read.
fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;

    while n < buf.len() {
        match file.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(r) => n += r,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}

/// Compute the CRC32 checksum of a file, reading `block_size` bytes at a time.
pub fn checksum_file(path: &Path, block_size: usize) -> Result<[u8; 4], TransferError> {
    validate_block_size(block_size, false)?;

    let io_error = |offset| move |source| TransferError::Io {
        path: path.to_owned(),
        offset,
        source,
    };

    let mut file = File::open(path).map_err(io_error(0))?;
    let mut buf = vec![0u8; block_size];
    let mut hasher = Hasher::new();
    let mut offset = 0;

    loop {
        let n = read_block(&mut file, &mut buf).map_err(io_error(offset))?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
        offset += n as u64;
    }

    Ok(hasher.finalize().to_be_bytes())
}

/// Decrypt an already downloaded firmware file. Returns the CRC32 checksum of
/// the encrypted input so that it can be compared against the metadata.
pub fn decrypt_file<O: TransferObserver + ?Sized>(
    input: &Path,
    output: &Path,
    key: &[u8; 16],
    block_size: usize,
    observer: &mut O,
) -> Result<[u8; 4], TransferError> {
    validate_block_size(block_size, true)?;

    let input_error = |offset| move |source| TransferError::Io {
        path: input.to_owned(),
        offset,
        source,
    };

    let mut input_file = File::open(input).map_err(input_error(0))?;
    let size = input_file.metadata().map_err(input_error(0))?.len();
    if size == 0 || size % AES_BLOCK_SIZE as u64 != 0 {
        return Err(TransferError::Crypto {
            offset: 0,
            source: CryptoError::InvalidCiphertextLength(size as usize),
        });
    }

    let file = File::create(output).map_err(|source| TransferError::Io {
        path: output.to_owned(),
        offset: 0,
        source,
    })?;
    let mut sink = BlockSink {
        file,
        path: output.to_owned(),
        cipher: Some(FirmwareCipher::new(key)),
    };

    observer.on_start(0, size);

    let mut buf = vec![0u8; block_size];
    let mut hasher = Hasher::new();
    let mut offset = 0;
    let mut output_len = 0;

    // Intentionally don't handle files that grow during reads
    while offset < size {
        if observer.is_cancelled() {
            return Err(TransferError::Cancelled { offset });
        }

        let to_read = cmp::min(size - offset, block_size as u64) as usize;
        let block = &mut buf[..to_read];
        input_file.read_exact(block).map_err(input_error(offset))?;

        hasher.update(block);

        let last = offset + to_read as u64 == size;
        output_len = sink.write_block(offset, block, last)?;

        offset += to_read as u64;
        observer.on_progress(to_read as u64);
    }

    sink.finish(output_len)?;

    Ok(hasher.finalize().to_be_bytes())
}
