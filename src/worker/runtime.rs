//! Worker side of the protocol
//!
//! [`serve`] turns any reader/writer pair into a worker: it waits for the
//! definition, builds a [`Responder`] from it and answers questions until
//! told to stop or the input closes.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::protocol::{write_message, ManagerMessage, MessageReader, WorkerMessage};
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

/// The bot logic hosted by a worker
pub trait Responder: Send {
    /// Answer one question. An `Err` is reported for this question only.
    fn respond(&mut self, question: &str) -> std::result::Result<String, String>;
}

/// Run the worker protocol until shutdown or end of input
pub async fn serve<R, W, F>(reader: R, mut writer: W, build: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&BotIdentity, &BotDefinition) -> std::result::Result<Box<dyn Responder>, String>,
{
    let mut reader = MessageReader::new(reader);

    let (identity, definition) = loop {
        match reader.next::<ManagerMessage>().await? {
            Some(ManagerMessage::Load { identity, definition }) => {
                break (identity, BotDefinition::new(definition))
            }
            Some(ManagerMessage::Shutdown) | None => return Ok(()),
            Some(other) => debug!(?other, "Ignoring message before load"),
        }
    };

    let mut responder = match build(&identity, &definition) {
        Ok(responder) => responder,
        Err(error) => {
            write_message(
                &mut writer,
                &WorkerMessage::Failed {
                    seq: None,
                    error: error.clone(),
                },
            )
            .await?;
            return Err(PoolError::WorkerSpawn(error));
        }
    };

    write_message(&mut writer, &WorkerMessage::Ready).await?;
    info!(identity = %identity, bytes = definition.len(), "Bot loaded");

    loop {
        match reader.next::<ManagerMessage>().await? {
            Some(ManagerMessage::Question { seq, text }) => {
                let reply = match responder.respond(&text) {
                    Ok(text) => WorkerMessage::Answer { seq, text },
                    Err(error) => WorkerMessage::Failed {
                        seq: Some(seq),
                        error,
                    },
                };
                write_message(&mut writer, &reply).await?;
            }
            Some(ManagerMessage::Load { .. }) => {
                warn!(identity = %identity, "Ignoring second load, a worker hosts one bot")
            }
            Some(ManagerMessage::Shutdown) | None => break,
        }
    }

    info!(identity = %identity, "Bot shutting down");
    Ok(())
}
