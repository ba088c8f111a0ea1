//! Serial port access.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Bytes written per chunk
pub const CHUNK_SIZE: usize = 64;
/// Pause after every chunk
pub const CHUNK_DELAY: Duration = Duration::from_millis(5);

/// Open the serial port at `path`
pub fn open_serial(path: &str, baud_rate: u32) -> io::Result<SerialStream> {
    let stream = tokio_serial::new(path, baud_rate)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(io::Error::from)?;
    info!("Opened serial port {} at {} baud", path, baud_rate);
    Ok(stream)
}

/// Write `data` in chunks of `chunk_size`, pausing `delay` after each.
///
/// The node's UART buffer is small, so long frames are paced.
pub async fn write_chunked<W>(writer: &mut W, data: &[u8], chunk_size: usize, delay: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in data.chunks(chunk_size.max(1)) {
        writer.write_all(chunk).await?;
        writer.flush().await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_write_chunked_paces_chunks() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        let data: Vec<u8> = (0..150u8).collect();

        let start = tokio::time::Instant::now();
        write_chunked(&mut near, &data, CHUNK_SIZE, CHUNK_DELAY).await.unwrap();
        assert_eq!(start.elapsed(), CHUNK_DELAY * 3);

        let mut received = vec![0u8; data.len()];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_write_chunked_empty() {
        let (mut near, _far) = tokio::io::duplex(16);
        write_chunked(&mut near, &[], CHUNK_SIZE, CHUNK_DELAY).await.unwrap();
    }
}
