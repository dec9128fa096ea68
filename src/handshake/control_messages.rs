use anyhow::{anyhow, bail};
use num_enum::TryFromPrimitive;


/// Handshake messages. Each one is encoded as a single byte on the control channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlMessage {
    Connect = 0,
    Accept = 1,
    RejectTooMany = 2,
    Disconnect = 3,
}
impl ControlMessage {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn ser(&self) -> [u8; 1] {
        [self.id()]
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<ControlMessage> {
        if buf.len() != 1 {
            bail!("control message must be exactly one byte, was {} bytes", buf.len());
        }
        ControlMessage::try_from(buf[0])
            .map_err(|_| anyhow!("unknown control message {}", buf[0]))
    }
}
