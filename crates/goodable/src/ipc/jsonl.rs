use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_jsonl<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value).map_err(invalid_data)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Line reader over an agent's stdout. CLIs interleave banners and warnings
/// with their JSON output, so lines that do not parse are counted and skipped.
pub struct JsonlReader<R> {
    reader: R,
    line: String,
    skipped: u64,
}

impl<R> JsonlReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            skipped: 0,
        }
    }

    /// Next parsed value, or `None` at end of stream.
    pub async fn next<T>(&mut self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str(trimmed) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => {
                    self.skipped += 1;
                    tracing::debug!(error = %err, line = %trimmed, "skipping non-json line");
                }
            }
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_values_in_order() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = JsonlReader::new(tokio::io::BufReader::new(b));

        let writer = tokio::spawn(async move {
            write_jsonl(&mut a, &serde_json::json!({"n": 1})).await.unwrap();
            write_jsonl(&mut a, &serde_json::json!({"n": 2})).await.unwrap();
        });

        let first: serde_json::Value = reader.next().await.unwrap().unwrap();
        let second: serde_json::Value = reader.next().await.unwrap().unwrap();
        assert_eq!(first, serde_json::json!({"n": 1}));
        assert_eq!(second, serde_json::json!({"n": 2}));

        writer.await.unwrap();
        let end: Option<serde_json::Value> = reader.next().await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn skips_blank_and_garbage_lines() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = JsonlReader::new(tokio::io::BufReader::new(b));

        a.write_all(b"\nWarning: telemetry disabled\n{\"ok\":true}\n")
            .await
            .unwrap();
        drop(a);

        let value: serde_json::Value = reader.next().await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
        assert_eq!(reader.skipped(), 1);
    }
}
