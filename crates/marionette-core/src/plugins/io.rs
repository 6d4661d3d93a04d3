//! Literal byte actions.

use async_trait::async_trait;
use marionette_proto::Value;

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::plugin::Plugin;

pub(crate) struct Puts;

pub(crate) struct Gets;

fn literal_arg(name: &str, args: &[Value]) -> Result<String> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidArguments(format!("{name}: string argument missing")))
}

#[async_trait]
impl Plugin for Puts {
    async fn eval(&self, fsm: &mut Fsm, args: &[Value]) -> Result<bool> {
        let data = literal_arg("io.puts", args)?;
        fsm.conn().write_all(data.as_bytes()).await?;
        Ok(true)
    }
}

#[async_trait]
impl Plugin for Gets {
    async fn eval(&self, fsm: &mut Fsm, args: &[Value]) -> Result<bool> {
        let expected = literal_arg("io.gets", args)?;
        let buffered = fsm.conn().peek_available().await?;
        if buffered.len() < expected.len() {
            return Ok(false);
        }
        if &buffered[..expected.len()] != expected.as_bytes() {
            return Ok(false);
        }
        fsm.conn().seek_forward(expected.len())?;
        Ok(true)
    }
}
