//! Byte-transport adapters.
//!
//! Bridges the codec's pull-based chunk streams and tokio's byte primitives:
//! one chunk per line, UTF-8, newline-terminated. Payloads are compact JSON
//! and never contain raw newlines, so line framing is unambiguous.

use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::DecodeError;

/// Write every chunk to `writer`, newline-terminated, flushing after each so
/// a frame is visible to the peer as soon as it exists.
///
/// Returns at the first transport error; the dropped chunk stream then takes
/// the encoder down its early-termination path.
pub async fn write_chunks<S, E, W>(mut chunks: S, mut writer: W) -> std::io::Result<()>
where
    S: Stream<Item = Result<String, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        writer.write_all(chunk.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

/// Read newline-framed chunks from `reader`.
///
/// A final line without a trailing newline still yields a chunk; transport
/// errors surface in-band so the decoder can interrupt its pending sinks.
pub fn read_chunks<R>(
    reader: R,
) -> impl Stream<Item = Result<String, DecodeError>> + Send + Unpin + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let lines = BufReader::new(reader).lines();
    Box::pin(futures::stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), lines)),
            Ok(None) => None,
            Err(err) => Some((Err(DecodeError::Transport(err)), lines)),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_chunks_survive_the_byte_pipe() {
        let (client, server) = tokio::io::duplex(256);
        let chunks = stream::iter(
            ["{\"a\":1}", "1:0:42", "2:2:\"done\""]
                .map(|chunk| Ok::<_, std::io::Error>(chunk.to_string())),
        );
        let writer = tokio::spawn(write_chunks(chunks, client));

        let received: Vec<String> = read_chunks(server)
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        assert_eq!(received, vec!["{\"a\":1}", "1:0:42", "2:2:\"done\""]);
        writer.await.expect("join").expect("write");
    }

    #[tokio::test]
    async fn test_last_chunk_without_newline_is_kept() {
        let reader = std::io::Cursor::new(b"{\"a\":1}\n1:0:42".to_vec());
        let received: Vec<String> = read_chunks(reader)
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        assert_eq!(received, vec!["{\"a\":1}", "1:0:42"]);
    }
}
