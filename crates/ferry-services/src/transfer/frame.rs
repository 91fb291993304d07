//! Async frame I/O over any byte stream, with the idle timeout applied to
//! every read and write.

use std::future::Future;
use std::time::Duration;

use ferry_core::wire::{Control, MAX_FRAME_LEN};
use ferry_core::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;

/// Run `fut`, failing with [`TransferError::Timeout`] if it stalls.
pub async fn idle<T, F>(timeout: Duration, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransferError::Timeout(timeout))?
}

fn eof_as_closed(e: std::io::Error) -> TransferError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransferError::Closed
    } else {
        TransferError::Io(e)
    }
}

/// Write `bytes` in full and flush them. A peer that stops reading fails
/// the write with [`TransferError::Timeout`].
pub async fn write_all<W>(w: &mut W, bytes: &[u8], timeout: Duration) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    idle(timeout, async {
        w.write_all(bytes).await?;
        w.flush().await?;
        Ok(())
    })
    .await
}

pub async fn write_frame<W>(w: &mut W, bytes: &[u8], timeout: Duration) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(4 + bytes.len());
    ferry_core::wire::put_frame(&mut buf, bytes);
    write_all(w, &buf, timeout).await
}

pub async fn write_token<W>(w: &mut W, token: &Control, timeout: Duration) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, token.to_string().as_bytes(), timeout).await
}

/// One length-prefixed frame. Frames over [`MAX_FRAME_LEN`] are refused
/// before any body byte is read.
pub async fn read_frame<R>(r: &mut R, timeout: Duration) -> Result<Vec<u8>, TransferError>
where
    R: AsyncRead + Unpin,
{
    idle(timeout, async {
        let len = r.read_u32().await.map_err(eof_as_closed)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len).into());
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await.map_err(eof_as_closed)?;
        Ok::<_, TransferError>(buf)
    })
    .await
}

pub async fn read_token<R>(r: &mut R, timeout: Duration) -> Result<Control, TransferError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(r, timeout).await?;
    let text = std::str::from_utf8(&frame)
        .map_err(|_| WireError::Malformed("control token is not UTF-8".into()))?;
    Ok(Control::parse(text)?)
}

/// Fill `buf` completely. Partial reads are looped over; the idle timeout
/// restarts after each read that makes progress.
pub async fn read_payload<R>(
    r: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = idle(timeout, async {
            Ok::<_, TransferError>(r.read(&mut buf[filled..]).await?)
        })
        .await?;
        if n == 0 {
            return Err(TransferError::Closed);
        }
        filled += n;
    }
    Ok(())
}
