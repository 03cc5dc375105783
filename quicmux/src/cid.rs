use std::fmt;
use std::ops::Deref;

use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection
///
/// Opaque, variable-length (up to [`MAX_CID_SIZE`] bytes). Datagrams are
/// routed to connections by the destination CID in their headers.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    /// Length of the CID
    len: u8,
    /// Possibly-invalid bytes, of which the first `len` are meaningful
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct a CID from `bytes`
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len() > MAX_CID_SIZE`.
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Whether this is the zero-length CID used in address-routed modes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Token carried at the tail of a stateless reset datagram
///
/// Agreed upon during the handshake; lets a peer that has lost all
/// connection state tell us to tear the connection down. The engine routes
/// such datagrams by token when no CID matches.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub fn new(bytes: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(bytes: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_round_trip() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(cid.len(), 8);
        assert_eq!(&*cid, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(format!("{cid}"), "0102030405060708");
    }

    #[test]
    fn zero_length_cid() {
        let cid = ConnectionId::new(&[]);
        assert!(cid.is_empty());
        assert_eq!(&*cid, &[] as &[u8]);
    }

    #[test]
    fn cids_compare_by_prefix_only() {
        let a = ConnectionId::new(&[9; 4]);
        let b = ConnectionId::new(&[9; 4]);
        assert_eq!(a, b);
        assert_ne!(a, ConnectionId::new(&[9; 5]));
    }
}
