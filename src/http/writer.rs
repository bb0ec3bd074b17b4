use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Renders the status line, header fields in order, and the body.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    encode(resp).to_vec()
}

fn encode(resp: &Response) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + resp.body.len());

    buf.put_slice(HTTP_VERSION.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(resp.status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(resp.status.reason_phrase().as_bytes());
    buf.put_slice(b"\r\n");

    for field in resp.headers.iter() {
        buf.put_slice(field.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(&field.value);
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(&resp.body);

    buf.freeze()
}

/// A serialized response waiting to be flushed to the client.
pub struct ResponseWriter {
    pending: Bytes,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            pending: encode(response),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Writes whatever is left. Resumable after an error.
    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while !self.pending.is_empty() {
            if stream.write_buf(&mut self.pending).await? == 0 {
                anyhow::bail!("connection closed while writing");
            }
        }

        stream.flush().await?;
        Ok(())
    }
}
