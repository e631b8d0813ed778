use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Instance;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const BUFFER_SIZE: usize = 8192;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Bytes moved by one pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes read from the client and written into the sandbox.
    pub to_sandbox: u64,

    /// Bytes read from the sandbox and written to the client.
    pub to_client: u64,
}

/// Event type for tracking bidirectional copy operations
enum DuplexEvent {
    /// Data received from the client
    ClientRead(usize),

    /// Data received from the sandbox
    SandboxRead(usize),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splices `client` and `sandbox` together until either side closes or errors, or the instance
/// is terminated. Every chunk moved counts as activity on `instance`. Both ends are shut down
/// before returning.
pub(crate) async fn splice<C, S>(mut client: C, mut sandbox: S, instance: &Instance) -> Transferred
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transferred = Transferred::default();
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut sandbox_buf = vec![0u8; BUFFER_SIZE];
    let token = instance.token();

    loop {
        let event = tokio::select! {
            _ = instance.terminated() => {
                tracing::debug!(token = %token, "instance terminated, closing stream");
                break;
            }
            result = client.read(&mut client_buf) => match result {
                Ok(n) => DuplexEvent::ClientRead(n),
                Err(e) => {
                    tracing::debug!(token = %token, error = %e, "client read error");
                    break;
                }
            },
            result = sandbox.read(&mut sandbox_buf) => match result {
                Ok(n) => DuplexEvent::SandboxRead(n),
                Err(e) => {
                    tracing::debug!(token = %token, error = %e, "sandbox read error");
                    break;
                }
            },
        };

        match event {
            DuplexEvent::ClientRead(0) => {
                tracing::debug!(token = %token, "client closed stream");
                break;
            }
            DuplexEvent::SandboxRead(0) => {
                tracing::debug!(token = %token, "sandbox closed stream");
                break;
            }
            DuplexEvent::ClientRead(n) => {
                instance.touch();
                if !forward(&mut sandbox, &client_buf[..n], instance).await {
                    break;
                }
                transferred.to_sandbox += n as u64;
            }
            DuplexEvent::SandboxRead(n) => {
                instance.touch();
                if !forward(&mut client, &sandbox_buf[..n], instance).await {
                    break;
                }
                transferred.to_client += n as u64;
            }
        }
    }

    let _ = client.shutdown().await;
    let _ = sandbox.shutdown().await;
    transferred
}

/// Writes `data` to `to`, giving up if the write fails or the instance is terminated first.
async fn forward<W>(to: &mut W, data: &[u8], instance: &Instance) -> bool
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        to.write_all(data).await?;
        to.flush().await
    };

    tokio::select! {
        _ = instance.terminated() => false,
        result = write => match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(token = %instance.token(), error = %e, "stream write error");
                false
            }
        },
    }
}
