//! Line framing for tool output.
//!
//! Progress bars redraw with `\r` and log lines end with `\n`; both terminate
//! a line here. Blank lines are skipped and overlong lines are discarded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Lines longer than this are dropped whole.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct ToolLineCodec {
    /// Skipping the remainder of an overlong line.
    discarding: bool,
}

impl ToolLineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_terminator(b: &u8) -> bool {
    *b == b'\n' || *b == b'\r'
}

impl Decoder for ToolLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(pos) = buf.iter().position(is_terminator) else {
                if buf.len() > MAX_LINE_LEN {
                    buf.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = buf.split_to(pos);
            buf.advance(1);

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            if text.is_empty() || line.len() > MAX_LINE_LEN {
                continue;
            }
            return Ok(Some(text.to_string()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&rest).trim_end().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}
