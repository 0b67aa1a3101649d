use anyhow::bail;
use media_proto::protocol::{decode, Outgoing, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl DaemonConnection {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        })
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        let encoded = request.encode()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Next message from the daemon, or `None` once it hangs up.
    pub async fn receive(&mut self) -> anyhow::Result<Option<Outgoing>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some((msg, consumed)) = decode::<Outgoing>(&self.read_buffer)? {
                self.read_buffer.drain(..consumed);
                return Ok(Some(msg));
            }
            match self.stream.read(&mut buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => self.read_buffer.extend_from_slice(&buf[..n]),
                Err(e) => bail!("Read error: {}", e),
            }
        }
    }

    /// Send `request` and wait for its RESPONSE.  Pushes that arrive in
    /// between are dropped.
    pub async fn request(&mut self, request: &Request) -> anyhow::Result<Response> {
        self.send(request).await?;
        loop {
            match self.receive().await? {
                Some(Outgoing::Response(response)) => return Ok(response),
                Some(_) => continue,
                None => bail!("daemon closed the connection"),
            }
        }
    }
}
