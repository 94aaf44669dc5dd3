//! A basic function for trying the relay end to end.
//! The same `execute` runs in Lambda as the original handler and locally behind the dispatcher.
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use tracing::info;

pub type Error = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Deserialize, Debug)]
pub struct Request {
    pub command: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Response {
    pub msg: String,
}

pub async fn execute(request: Request) -> Result<Response, Error> {
    info!("Command received: {}", request.command);

    if request.command.trim().is_empty() {
        return Err(Error::from("Empty command"));
    }

    Ok(Response {
        msg: format!("Command {} executed.", request.command),
    })
}
