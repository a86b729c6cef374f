use tracing::trace;

use crate::error::{AppResult, MasterError};
use crate::protocol::{FrameDecoder, ACK};
use crate::transport::{SlaveLink, Transport};

/// Sends `frame` and returns the raw reply.
pub(crate) async fn request<L: SlaveLink>(
    transport: &Transport<L>,
    frame: &[u8],
) -> AppResult<Vec<u8>> {
    trace!(frame = ?frame, "request");
    let reply = transport.request(frame, transport.command_timeout()).await?;
    trace!(reply = ?reply, "reply");
    Ok(reply)
}

/// Sends an action frame whose reply is `[module][sub][ack]`.
pub(crate) async fn send_action<L: SlaveLink>(
    transport: &Transport<L>,
    frame: &[u8],
) -> AppResult<bool> {
    let (module, sub) = (frame[0], frame[1]);
    let reply = request(transport, frame).await?;
    let mut dec = FrameDecoder::new(&reply, module, sub)?;
    Ok(dec.read_u8()? == ACK)
}

/// Sends an action frame whose reply is `[module][sub][ack][id]` and checks the echo.
pub(crate) async fn send_action_echo<L: SlaveLink>(
    transport: &Transport<L>,
    frame: &[u8],
    field: &'static str,
    id: u8,
) -> AppResult<bool> {
    let (module, sub) = (frame[0], frame[1]);
    let reply = request(transport, frame).await?;
    let mut dec = FrameDecoder::new(&reply, module, sub)?;
    let accepted = dec.read_u8()? == ACK;
    check_echo(module, field, id, dec.read_u8()?)?;
    Ok(accepted)
}

pub(crate) fn check_echo(module: u8, field: &'static str, expected: u8, found: u8) -> AppResult<()> {
    if expected != found {
        return Err(MasterError::EchoMismatch {
            module,
            field,
            expected,
            found,
        });
    }
    Ok(())
}
