use ractor::{MessagingErr, SpawnErr};
use thiserror::Error;

use crate::{
    switch::{
        circuit_map::CircuitError,
        link::{LinkActorMessage, ProcessingLinkError},
        SwitchActorMessage,
    },
    types::{ChannelId, ShortChannelId},
    wire::WireError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Link not found error: {0:?}")]
    LinkNotFound(ChannelId),
    #[error("No link for short channel id: {0}")]
    UnknownNextPeer(ShortChannelId),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(#[from] SpawnErr),
    #[error("Failed to send link actor message: {0}")]
    LinkMessagingErr(#[from] MessagingErr<LinkActorMessage>),
    #[error("Failed to send switch actor message: {0}")]
    SwitchMessagingErr(#[from] MessagingErr<SwitchActorMessage>),
    #[error("Failed to process link update: {0}")]
    LinkError(#[from] ProcessingLinkError),
    #[error("Circuit map error: {0}")]
    CircuitError(#[from] CircuitError),
    #[error("Wire codec error: {0}")]
    WireError(#[from] WireError),
    #[error("Alias not found")]
    AliasNotFound,
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),
    #[error("Database error: {0}")]
    DBInternalError(String),
    #[error("Internal error: {0}")]
    InternalError(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
