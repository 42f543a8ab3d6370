use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Anything that can stand in for a serial port.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("No device is connected")]
    NotConnected,

    #[error("Device is not writable")]
    NotWritable,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Chunk(Vec<u8>),
    /// The device closed its end of the stream.
    End,
    /// The transport is being closed.
    Cancelled,
}

/// The single reader of a transport. Only one exists per connection.
pub struct TransportReader {
    inner: ReadHalf<Box<dyn SerialIo>>,
    cancel: CancellationToken,
    buf: Vec<u8>,
}

impl TransportReader {
    /// Wait for the next chunk. Returns [`ReadOutcome::Cancelled`] as soon as
    /// the owning [`Transport`] starts closing, even mid-read.
    pub async fn read(&mut self) -> Result<ReadOutcome, ReadError> {
        if self.cancel.is_cancelled() {
            return Ok(ReadOutcome::Cancelled);
        }
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Ok(ReadOutcome::Cancelled),

            read = self.inner.read(&mut self.buf) => match read? {
                0 => Ok(ReadOutcome::End),
                n => Ok(ReadOutcome::Chunk(self.buf[..n].to_vec())),
            },
        }
    }

    /// Liveness check for loops driving this reader.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Owns the write side of an open connection plus the task reading from it.
pub struct Transport {
    writer: Option<WriteHalf<Box<dyn SerialIo>>>,
    cancel: CancellationToken,
    reader_task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Split an opened port into the transport and its one reader.
    pub fn split(io: Box<dyn SerialIo>, chunk_size: usize) -> (Self, TransportReader) {
        let (read_half, write_half) = tokio::io::split(io);
        let cancel = CancellationToken::new();
        let reader = TransportReader {
            inner: read_half,
            cancel: cancel.clone(),
            buf: vec![0; chunk_size.max(1)],
        };
        let transport = Self {
            writer: Some(write_half),
            cancel,
            reader_task: None,
        };
        (transport, reader)
    }

    /// Bind the task consuming the reader, so close can wait for it.
    pub fn attach_reader_task(&mut self, task: JoinHandle<()>) {
        self.reader_task = Some(task);
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn is_writable(&self) -> bool {
        self.is_open() && self.writer.is_some()
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        if !self.is_open() {
            return Err(WriteError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(WriteError::NotWritable)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a text command terminated by a newline.
    pub async fn write_line(&mut self, command: &str) -> Result<(), WriteError> {
        self.write(format!("{command}\n").as_bytes()).await
    }

    /// Cancel the in-flight read, wait for the reader task to let go, then
    /// release the port. Each step runs even if the previous one failed.
    /// Calling it again does nothing.
    pub async fn close(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.reader_task.take() {
            if let Err(e) = task.await {
                log::warn!("Reader task ended abnormally: {}", e);
            }
        }

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                log::warn!("Error releasing serial port: {}", e);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (Transport, TransportReader, tokio::io::DuplexStream) {
        let (host, device) = duplex(256);
        let (transport, reader) = Transport::split(Box::new(host), 64);
        (transport, reader, device)
    }

    #[tokio::test]
    async fn test_read_chunk_and_end() {
        let (_transport, mut reader, mut device) = pair();
        device.write_all(b"1,2\n").await.unwrap();
        assert_eq!(
            reader.read().await.unwrap(),
            ReadOutcome::Chunk(b"1,2\n".to_vec())
        );

        drop(device);
        assert_eq!(reader.read().await.unwrap(), ReadOutcome::End);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_read() {
        let (mut transport, mut reader, _device) = pair();
        let task = tokio::spawn(async move {
            let outcome = reader.read().await.unwrap();
            assert_eq!(outcome, ReadOutcome::Cancelled);
            assert!(reader.is_cancelled());
        });
        transport.attach_reader_task(task);

        transport.close().await;
        assert!(!transport.is_open());
        assert!(!transport.is_writable());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, _reader, _device) = pair();
        transport.close().await;
        transport.close().await;
        assert!(matches!(
            transport.write(b"x").await,
            Err(WriteError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_survives_panicking_reader() {
        let (mut transport, _reader, _device) = pair();
        transport.attach_reader_task(tokio::spawn(async {
            panic!("reader blew up");
        }));
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let (mut transport, _reader, mut device) = pair();
        transport.write_line("START").await.unwrap();

        let mut received = [0u8; 6];
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"START\n");
    }
}
