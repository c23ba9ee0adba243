//! Line-oriented channel: `sender: text` in, `recipient: text` out.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use super::{ChannelAdapter, InboundMessage, OutboundMessage};
use crate::types::{Identity, Result};

/// Channel over any line reader and writer.
///
/// Malformed input lines are logged and skipped.
#[derive(Debug)]
pub struct LineChannel<R, W> {
    lines: Mutex<Lines<R>>,
    writer: Mutex<W>,
}

/// The daemon binary's channel.
pub type StdioChannel = LineChannel<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdioChannel {
    pub fn stdio() -> Self {
        LineChannel::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
            writer: Mutex::new(writer),
        }
    }
}

fn parse_line(line: &str) -> Option<InboundMessage> {
    let (sender, text) = line.split_once(':')?;
    let sender = Identity::new(sender.trim()).ok()?;
    Some(InboundMessage::new(sender, text.trim()))
}

#[async_trait]
impl<R, W> ChannelAdapter for LineChannel<R, W>
where
    R: AsyncBufRead + Unpin + Send + std::fmt::Debug,
    W: AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    fn name(&self) -> &str {
        "line"
    }

    async fn recv(&self) -> Option<InboundMessage> {
        let mut lines = self.lines.lock().await;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match parse_line(&line) {
                    Some(msg) => return Some(msg),
                    None => tracing::warn!(line = %line, "line_channel_malformed"),
                },
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(error = %e, "line_channel_read_failed");
                    return None;
                }
            }
        }
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let line = format!("{}: {}\n", message.recipient, message.payload.as_text());
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;

    #[test]
    fn test_parse_line() {
        let msg = parse_line("alice: echo hi: there").unwrap();
        assert_eq!(msg.sender.as_str(), "alice");
        assert_eq!(msg.text, "echo hi: there");
        assert!(parse_line("no separator").is_none());
        assert!(parse_line(": missing sender").is_none());
    }

    #[tokio::test]
    async fn test_reads_and_writes_lines() {
        let input: &[u8] = b"alice: echo one\n\ngarbage\nbob: time\n";
        let channel = LineChannel::new(input, Vec::<u8>::new());

        assert_eq!(channel.recv().await.unwrap().text, "echo one");
        assert_eq!(channel.recv().await.unwrap().sender.as_str(), "bob");
        assert!(channel.recv().await.is_none());

        channel
            .send(OutboundMessage {
                recipient: Identity::new("alice").unwrap(),
                payload: Payload::Text("one".into()),
            })
            .await
            .unwrap();
        let written = channel.writer.lock().await.clone();
        assert_eq!(String::from_utf8(written).unwrap(), "alice: one\n");
    }
}
