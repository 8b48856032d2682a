// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Server name extraction from the first TLS record of a connection.
//!
//! The record is read off the client socket into a bounded buffer and parsed
//! just far enough to find the `server_name` extension. Every byte read is
//! handed back so it can be replayed to the backend unchanged.
//!
//! ```text
//! record     type:1 (0x16) version:2 length:2
//! handshake  type:1 (0x01) length:3
//! hello      version:2 random:32 session_id:<1> cipher_suites:<2>
//!            compression_methods:<1> extensions:<2>
//! extension  type:2 length:2 body
//! sni        list:<2> { type:1 length:2 name }
//! ```

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const RECORD_HEADER_LEN: usize = 5;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("connection closed after {0} bytes of the record header")]
    ShortRead(usize),
    #[error("record type {0:#04x} is not a handshake")]
    NotHandshake(u8),
    #[error("record of {needed} bytes does not fit the {capacity} byte handshake buffer")]
    RecordTooLarge { needed: usize, capacity: usize },
    #[error("handshake type {0:#04x} is not a ClientHello")]
    NotClientHello(u8),
    #[error("ClientHello truncated in {0}")]
    Truncated(&'static str),
    #[error("ClientHello does not carry a host name")]
    NoServerName,
    #[error("server name is not valid UTF-8")]
    InvalidServerName,
    #[error("failed reading ClientHello")]
    Io(#[source] io::Error),
}

/// Result of sniffing a connection.
#[derive(Debug)]
pub struct Sniffed {
    pub server_name: Result<String, SniError>,
    /// Exactly the bytes taken from the stream, in order.
    pub consumed: Vec<u8>,
}

/// Reads the first TLS record from `stream` and extracts the SNI host name.
///
/// At most `capacity` bytes are read, and never more than the record the
/// client announced.
pub async fn sniff<R>(stream: &mut R, capacity: usize) -> Sniffed
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; capacity];
    let mut filled = 0;
    let server_name = read_server_name(stream, &mut buffer, &mut filled).await;
    buffer.truncate(filled);
    Sniffed {
        server_name,
        consumed: buffer,
    }
}

async fn read_server_name<R>(
    stream: &mut R,
    buffer: &mut [u8],
    filled: &mut usize,
) -> Result<String, SniError>
where
    R: AsyncRead + Unpin,
{
    let capacity = buffer.len();
    if capacity < RECORD_HEADER_LEN {
        return Err(SniError::RecordTooLarge {
            needed: RECORD_HEADER_LEN,
            capacity,
        });
    }

    fill(stream, &mut buffer[..RECORD_HEADER_LEN], filled).await?;
    if *filled < RECORD_HEADER_LEN {
        return Err(SniError::ShortRead(*filled));
    }

    if buffer[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(buffer[0]));
    }

    let needed = RECORD_HEADER_LEN + usize::from(u16::from_be_bytes([buffer[3], buffer[4]]));
    if needed > capacity {
        return Err(SniError::RecordTooLarge { needed, capacity });
    }

    fill(stream, &mut buffer[..needed], filled).await?;
    if *filled < needed {
        return Err(SniError::Truncated("record"));
    }

    parse_server_name(&buffer[RECORD_HEADER_LEN..needed]).map(str::to_owned)
}

/// Reads until `buffer` is full or the stream ends.
async fn fill<R>(stream: &mut R, buffer: &mut [u8], filled: &mut usize) -> Result<(), SniError>
where
    R: AsyncRead + Unpin,
{
    while *filled < buffer.len() {
        match stream.read(&mut buffer[*filled..]).await {
            Ok(0) => break,
            Ok(n) => *filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(SniError::Io(error)),
        }
    }
    Ok(())
}

/// Finds the first host name entry of the `server_name` extension in a
/// handshake message.
pub fn parse_server_name(handshake: &[u8]) -> Result<&str, SniError> {
    let mut hello = Cursor(handshake);

    let handshake_type = hello.u8("handshake type")?;
    if handshake_type != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(handshake_type));
    }
    hello.take(3, "handshake length")?;
    hello.take(2, "client version")?;
    hello.take(32, "random")?;
    hello.vector8("session id")?;
    hello.vector16("cipher suites")?;
    hello.vector8("compression methods")?;

    if hello.is_empty() {
        // extensions are optional before TLS 1.2
        return Err(SniError::NoServerName);
    }

    let mut extensions = hello.vector16("extensions")?;
    while !extensions.is_empty() {
        let extension_type = extensions.u16("extension type")?;
        let mut body = extensions.vector16("extension")?;
        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = body.vector16("server name list")?;
        while !names.is_empty() {
            let name_type = names.u8("server name type")?;
            let name = names.vector16("server name")?;
            if name_type == NAME_TYPE_HOST_NAME {
                return match std::str::from_utf8(name.0) {
                    Ok("") => Err(SniError::NoServerName),
                    Ok(name) => Ok(name),
                    Err(_) => Err(SniError::InvalidServerName),
                };
            }
        }
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked reader over a byte slice.
struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], SniError> {
        if self.0.len() < len {
            return Err(SniError::Truncated(field));
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, SniError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// A vector with a one byte length prefix.
    fn vector8(&mut self, field: &'static str) -> Result<Cursor<'a>, SniError> {
        let len = self.u8(field)?;
        self.take(usize::from(len), field).map(Cursor)
    }

    /// A vector with a two byte length prefix.
    fn vector16(&mut self, field: &'static str) -> Result<Cursor<'a>, SniError> {
        let len = self.u16(field)?;
        self.take(usize::from(len), field).map(Cursor)
    }
}
