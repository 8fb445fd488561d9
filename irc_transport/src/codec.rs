use crate::error::TransportError;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum length of a protocol line, including the CR-LF terminator.
pub const MAX_LINE_LENGTH: usize = 2048;

const TERMINATOR: &[u8] = b"\r\n";

/// Splits a byte stream into CR-LF terminated lines, decoded as UTF-8, and
/// terminates outbound lines.
///
/// Lines longer than the maximum are a framing fault, not truncated.
#[derive(Debug)]
pub struct LineCodec
{
    max_length: usize,
    // Everything before this index has already been searched for a terminator
    next_index: usize,
}

impl LineCodec
{
    pub fn new(max_length: usize) -> Self
    {
        Self { max_length, next_index: 0 }
    }
}

impl Default for LineCodec
{
    fn default() -> Self
    {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec
{
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, TransportError>
    {
        // A CR may have been the last byte seen last time
        let start = self.next_index.saturating_sub(1).min(buf.len());

        match buf[start..].windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
        {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;

                if end + TERMINATOR.len() > self.max_length
                {
                    buf.advance(end + TERMINATOR.len());
                    return Err(TransportError::LineTooLong { max: self.max_length });
                }

                let line = buf.split_to(end + TERMINATOR.len());
                Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
            }
            None if buf.len() >= self.max_length => {
                buf.clear();
                self.next_index = 0;
                Err(TransportError::LineTooLong { max: self.max_length })
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, TransportError>
    {
        match self.decode(buf)?
        {
            Some(line) => Ok(Some(line)),
            None => {
                if !buf.is_empty()
                {
                    tracing::trace!("Discarding {} bytes of unterminated input", buf.len());
                    buf.clear();
                    self.next_index = 0;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec
{
    type Error = TransportError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), TransportError>
    {
        dst.reserve(line.len() + TERMINATOR.len());
        dst.put_slice(line.as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
