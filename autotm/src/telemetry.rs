use serde::{Deserialize, Serialize};
use std::{io::ErrorKind, net::UdpSocket};

use crate::{
    command::{Command, Execution},
    tuner::Session,
    Result,
};

/// What one command line did, as sent to a telemetry listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub line: String,
    pub command: Option<Command>,
    pub replies: Vec<String>,
    pub session: Option<Session>,
}

impl Report {
    pub fn new(line: &str, execution: &Execution) -> Self {
        Self {
            line: line.trim().to_owned(),
            command: execution.command,
            replies: execution.replies.iter().map(ToString::to_string).collect(),
            session: execution.session.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::<u8>::new();
        ciborium::ser::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Sends one datagram to the socket's connected peer. A listener that is
    /// not running is not an error.
    pub fn send(&self, socket: &UdpSocket) -> Result<()> {
        let buf = self.encode()?;
        if let Err(e) = socket.send(&buf) {
            match e.kind() {
                ErrorKind::ConnectionRefused => Ok(()),
                _ => Err(e),
            }?
        }
        Ok(())
    }
}
