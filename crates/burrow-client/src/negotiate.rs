//! Session configuration exchange
//!
//! The `config` request travels on its own session channel: the client asks
//! for the `config` subsystem with want-reply, writes the JSON payload, sends
//! EOF and collects the reply until the server ends the channel. An empty
//! reply accepts the configuration; anything else is the rejection reason.

use burrow_proto::{SessionConfig, CONFIG_REQUEST};
use russh::ChannelMsg;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::handshake::SecureConnection;

fn send_failed(err: impl std::fmt::Display) -> ClientError {
    info!("Config verification failed");
    ClientError::ConfigSend(err.to_string())
}

/// Send `config` and wait for the server's verdict
pub async fn negotiate(connection: &SecureConnection, config: &SessionConfig) -> Result<()> {
    debug!("Sending config");
    let payload = config.encode()?;

    let mut channel = connection
        .channel_open_session()
        .await
        .map_err(send_failed)?;
    channel
        .request_subsystem(true, CONFIG_REQUEST)
        .await
        .map_err(send_failed)?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => break,
            Some(ChannelMsg::Failure) => {
                return Err(ClientError::ConfigRejected(
                    "config request refused".to_string(),
                ))
            }
            Some(other) => debug!("Ignoring {:?} while awaiting config reply", other),
            None => return Err(send_failed("channel closed before reply")),
        }
    }

    channel.data(&payload[..]).await.map_err(send_failed)?;
    channel.eof().await.map_err(send_failed)?;

    let mut reply = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => reply.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    let _ = channel.close().await;

    interpret_reply(&reply)
}

/// Empty reply accepts, anything else is a UTF-8 rejection reason
pub fn interpret_reply(reply: &[u8]) -> Result<()> {
    if reply.is_empty() {
        return Ok(());
    }
    Err(ClientError::ConfigRejected(
        String::from_utf8_lossy(reply).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Disposition;

    #[test]
    fn test_empty_reply_accepts() {
        assert!(interpret_reply(b"").is_ok());
    }

    #[test]
    fn test_reply_is_rejection_reason() {
        let err = interpret_reply(b"Reverse port forwarding not enabled on server").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Reverse port forwarding not enabled on server"
        );
        assert_eq!(err.disposition(), Disposition::FatalProtocol);
    }
}
