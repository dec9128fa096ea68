use std::fmt::{Debug, Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;


/// A [PeerId] is the raw transport's address of a remote endpoint - a 64 bit Steam ID in the
///  Steam domain. It is opaque to this crate: it is compared, hashed and passed back to the
///  transport, but never interpreted.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(pub u64);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[peer:{}]", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        PeerId(value)
    }
}

/// Peer ids are typically entered as decimal numbers in connection dialogs
impl FromStr for PeerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(s.trim().parse()?))
    }
}
