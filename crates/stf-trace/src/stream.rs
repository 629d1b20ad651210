//! Byte streams behind STF readers and writers. The container format is
//! picked from the file name.

use std::{
    env, fmt,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Read, Stdin, Stdout, Write},
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use anyhow::{Error, anyhow, bail, ensure};
use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use log::{debug, warn};

use crate::zstf::{reader::ZstfReader, writer::ZstfWriter};

/// Forces synchronous decompression of `.zstf` traces when set to `1`/`true`
pub const SINGLE_THREADED_VAR: &str = "STF_SINGLE_THREADED";

pub const DEFAULT_GZIP_LEVEL: i32 = 6;
pub const DEFAULT_XZ_LEVEL: i32 = 3;

/// Container format of a trace file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Zstf,
    Stdio,
    Gzip,
    Xz,
    Shell,
    Plain,
    Unknown,
}

impl FileType {
    pub fn guess(path: &Path) -> Self {
        let name = path.to_string_lossy();

        if name.ends_with(".zstf") {
            FileType::Zstf
        } else if name == "-" {
            FileType::Stdio
        } else if name.ends_with(".stf.gz") {
            FileType::Gzip
        } else if name.ends_with(".stf.xz") {
            FileType::Xz
        } else if name.ends_with(".sh") {
            FileType::Shell
        } else if name.ends_with(".stf") {
            FileType::Plain
        } else {
            FileType::Unknown
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, FileType::Zstf | FileType::Gzip | FileType::Xz)
    }
}

fn parse_boolean(name: &str, value: Option<&str>) -> Result<bool, Error> {
    match value {
        None | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => bail!(
            "Invalid value for environment variable {name}: {other}. Allowed values are 0, 1, false, true"
        ),
    }
}

/// Reads `STF_SINGLE_THREADED` from the environment
pub fn single_threaded_from_env() -> Result<bool, Error> {
    match env::var(SINGLE_THREADED_VAR) {
        Ok(value) => parse_boolean(SINGLE_THREADED_VAR, Some(&value)),
        Err(env::VarError::NotPresent) => parse_boolean(SINGLE_THREADED_VAR, None),
        Err(e) => bail!("Invalid value for environment variable {SINGLE_THREADED_VAR}: {e}"),
    }
}

/// The stdout of a child process producing trace data
pub struct ProcessInput {
    command: String,
    child: Child,
    stdout: ChildStdout,
}

impl ProcessInput {
    fn spawn(mut command: Command) -> Result<Self, Error> {
        let description = format!("{command:?}");
        let mut child = command.stdout(Stdio::piped()).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stdout of {description}"))?;

        debug!("Reading trace from {description}");

        Ok(Self {
            command: description,
            child,
            stdout,
        })
    }
}

impl Read for ProcessInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} exited with {status}",
                    self.command
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for ProcessInput {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// The stdin of a child process consuming trace data
pub struct ProcessOutput {
    command: String,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl ProcessOutput {
    fn spawn(mut command: Command, output: File) -> Result<Self, Error> {
        let description = format!("{command:?}");
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::from(output))
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stdin of {description}"))?;

        debug!("Writing trace through {description}");

        Ok(Self {
            command: description,
            child,
            stdin: Some(BufWriter::new(stdin)),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        stdin.flush()?;
        drop(stdin);

        let status = self.child.wait()?;
        ensure!(status.success(), "{} exited with {status}", self.command);

        Ok(())
    }
}

impl Write for ProcessOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::other(format!("{} was already closed", self.command))),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

/// The decompressed byte stream of a trace file
pub enum InputStream {
    Plain(File),
    Stdin(Stdin),
    Gzip(MultiGzDecoder<File>),
    Process(ProcessInput),
    Zstf(ZstfReader<File>),
}

impl InputStream {
    /// Opens `path`, choosing the container format from its name. Unknown
    /// extensions are read as plain STF.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, a helper process cannot be
    /// started or a `.zstf` header is corrupt.
    pub fn open(path: &Path, single_threaded: bool) -> Result<Self, Error> {
        let stream = match FileType::guess(path) {
            FileType::Zstf => InputStream::Zstf(ZstfReader::new(File::open(path)?, single_threaded)?),
            FileType::Gzip => InputStream::Gzip(MultiGzDecoder::new(File::open(path)?)),
            FileType::Xz => {
                let mut command = Command::new("xz");
                command.arg("-dc").arg(path);
                InputStream::Process(ProcessInput::spawn(command)?)
            }
            FileType::Shell => {
                let mut command = Command::new("sh");
                command.arg(path);
                InputStream::Process(ProcessInput::spawn(command)?)
            }
            FileType::Stdio => InputStream::Stdin(io::stdin()),
            FileType::Unknown => {
                warn!(
                    "File {} has an unrecognized extension. Attempting to open as a normal STF.",
                    path.display()
                );
                InputStream::Plain(File::open(path)?)
            }
            FileType::Plain => InputStream::Plain(File::open(path)?),
        };

        Ok(stream)
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputStream::Plain(input) => input.read(buf),
            InputStream::Stdin(input) => input.read(buf),
            InputStream::Gzip(input) => input.read(buf),
            InputStream::Process(input) => input.read(buf),
            InputStream::Zstf(input) => input.read(buf),
        }
    }
}

/// Compression settings used when creating an [`OutputStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    /// Falls back to the container's default level if unset
    pub compression_level: Option<i32>,
    /// Marker records per `.zstf` chunk
    pub chunk_size: u64,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            compression_level: None,
            chunk_size: crate::zstf::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// The sink of an STF writer
pub enum OutputStream {
    Plain(BufWriter<File>),
    Stdout(BufWriter<Stdout>),
    Gzip(GzEncoder<BufWriter<File>>),
    Process(ProcessOutput),
    Zstf(ZstfWriter<BufWriter<File>>),
}

fn create_file(path: &Path) -> Result<File, Error> {
    Ok(OpenOptions::new()
        .truncate(true)
        .write(true)
        .create(true)
        .open(path)?)
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Plain(_) => f.write_str("OutputStream::Plain"),
            OutputStream::Stdout(_) => f.write_str("OutputStream::Stdout"),
            OutputStream::Gzip(_) => f.write_str("OutputStream::Gzip"),
            OutputStream::Process(_) => f.write_str("OutputStream::Process"),
            OutputStream::Zstf(writer) => f.debug_tuple("OutputStream::Zstf").field(writer).finish(),
        }
    }
}

impl OutputStream {
    /// Creates `path`, choosing the container format from its name.
    ///
    /// # Errors
    ///
    /// Fails for unknown extensions, for `.sh` files and if the file or a
    /// helper process cannot be created.
    pub fn create(path: &Path, options: OutputOptions) -> Result<Self, Error> {
        let stream = match FileType::guess(path) {
            FileType::Zstf => {
                let level = options
                    .compression_level
                    .unwrap_or(crate::zstf::DEFAULT_COMPRESSION_LEVEL);
                OutputStream::Zstf(ZstfWriter::new(
                    BufWriter::new(create_file(path)?),
                    options.chunk_size,
                    level,
                )?)
            }
            FileType::Gzip => {
                let level = options.compression_level.unwrap_or(DEFAULT_GZIP_LEVEL);
                ensure!(
                    (0..=9).contains(&level),
                    "Invalid gzip compression level: {level}"
                );
                OutputStream::Gzip(GzEncoder::new(
                    BufWriter::new(create_file(path)?),
                    Compression::new(level.unsigned_abs()),
                ))
            }
            FileType::Xz => {
                let level = options.compression_level.unwrap_or(DEFAULT_XZ_LEVEL);
                ensure!(
                    (0..=9).contains(&level),
                    "Invalid xz compression level: {level}"
                );
                let mut command = Command::new("xz");
                command.arg("-z").arg(format!("-{level}"));
                OutputStream::Process(ProcessOutput::spawn(command, create_file(path)?)?)
            }
            FileType::Stdio => OutputStream::Stdout(BufWriter::new(io::stdout())),
            FileType::Plain => OutputStream::Plain(BufWriter::new(create_file(path)?)),
            FileType::Shell => bail!(".sh format is not supported by the STF writer"),
            FileType::Unknown => bail!("File {} has an unrecognized extension.", path.display()),
        };

        Ok(stream)
    }
}

/// A byte sink that STF writers can finalize
pub trait TraceOutput: Write {
    /// Signals that a marker record has just been written. `next_pc` is the
    /// PC of the instruction that follows it.
    fn marker_record(&mut self, next_pc: u64) -> Result<(), Error> {
        let _ = next_pc;
        Ok(())
    }

    /// Flushes all pending data and finalizes the container
    fn close(&mut self) -> Result<(), Error> {
        self.flush()?;
        Ok(())
    }
}

impl TraceOutput for Vec<u8> {}

impl TraceOutput for OutputStream {
    fn marker_record(&mut self, next_pc: u64) -> Result<(), Error> {
        if let OutputStream::Zstf(output) = self {
            output.marker_record(next_pc)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        match self {
            OutputStream::Plain(output) => output.flush()?,
            OutputStream::Stdout(output) => output.flush()?,
            OutputStream::Gzip(output) => {
                output.try_finish()?;
                output.get_mut().flush()?;
            }
            OutputStream::Process(output) => output.close()?,
            OutputStream::Zstf(output) => output.finish()?,
        }

        Ok(())
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputStream::Plain(output) => output.write(buf),
            OutputStream::Stdout(output) => output.write(buf),
            OutputStream::Gzip(output) => output.write(buf),
            OutputStream::Process(output) => output.write(buf),
            OutputStream::Zstf(output) => output.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::Plain(output) => output.flush(),
            OutputStream::Stdout(output) => output.flush(),
            OutputStream::Gzip(output) => output.flush(),
            OutputStream::Process(output) => output.flush(),
            OutputStream::Zstf(output) => output.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        path::Path,
    };

    use anyhow::Error;
    use tempfile::tempdir;

    use super::{FileType, InputStream, OutputOptions, OutputStream, TraceOutput, parse_boolean};

    #[test]
    fn guess_file_types() {
        let cases = [
            ("trace.zstf", FileType::Zstf),
            ("-", FileType::Stdio),
            ("trace.stf.gz", FileType::Gzip),
            ("trace.stf.xz", FileType::Xz),
            ("generate.sh", FileType::Shell),
            ("dir/trace.stf", FileType::Plain),
            ("trace.gz", FileType::Unknown),
            ("trace.bin", FileType::Unknown),
        ];

        for (name, file_type) in cases {
            assert_eq!(FileType::guess(Path::new(name)), file_type, "{name}");
        }
    }

    #[test]
    fn parse_single_threaded_values() {
        assert!(!parse_boolean("VAR", None).unwrap());
        assert!(!parse_boolean("VAR", Some("0")).unwrap());
        assert!(!parse_boolean("VAR", Some("false")).unwrap());
        assert!(parse_boolean("VAR", Some("1")).unwrap());
        assert!(parse_boolean("VAR", Some("true")).unwrap());
        parse_boolean("VAR", Some("yes")).unwrap_err();
        parse_boolean("VAR", Some("TRUE")).unwrap_err();
    }

    #[test]
    fn write_and_read_gzip_stream() -> Result<(), Error> {
        let dir = tempdir()?;
        let path = dir.path().join("trace.stf.gz");

        let mut output = OutputStream::create(&path, OutputOptions::default())?;
        output.write_all(b"gzip payload")?;
        output.close()?;
        drop(output);

        let mut input = InputStream::open(&path, true)?;
        let mut payload = Vec::new();
        input.read_to_end(&mut payload)?;
        assert_eq!(payload, b"gzip payload");

        Ok(())
    }

    #[test]
    fn reject_unwritable_file_types() -> Result<(), Error> {
        let dir = tempdir()?;

        OutputStream::create(&dir.path().join("trace.sh"), OutputOptions::default()).unwrap_err();
        OutputStream::create(&dir.path().join("trace.bin"), OutputOptions::default())
            .unwrap_err();
        OutputStream::create(
            &dir.path().join("trace.stf.gz"),
            OutputOptions {
                compression_level: Some(12),
                ..OutputOptions::default()
            },
        )
        .unwrap_err();

        Ok(())
    }

    #[test]
    fn read_unknown_extension_as_plain() -> Result<(), Error> {
        let dir = tempdir()?;
        let path = dir.path().join("trace.bin");
        std::fs::write(&path, b"plain")?;

        let mut payload = Vec::new();
        InputStream::open(&path, true)?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"plain");

        Ok(())
    }
}
