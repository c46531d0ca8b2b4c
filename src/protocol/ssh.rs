//! Minimal reader for the SSH userauth blob a workstation asks us to sign.
//!
//! Only the prefix of `SSH_MSG_USERAUTH_REQUEST` is read:
//!
//! ```text
//! string    session identifier
//! byte      SSH_MSG_USERAUTH_REQUEST (50)
//! string    user name
//! ...
//! ```

/// Message number of `SSH_MSG_USERAUTH_REQUEST`
const SSH_MSG_USERAUTH_REQUEST: u8 = 50;

/// Extract the login user from signed userauth data, if it parses as one.
pub fn userauth_user(data: &[u8]) -> Option<String> {
    let mut reader = Reader { buf: data };
    reader.string()?;
    if reader.byte()? != SSH_MSG_USERAUTH_REQUEST {
        return None;
    }
    let user = reader.string()?;
    String::from_utf8(user.to_vec()).ok()
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Option<u8> {
        let (first, rest) = self.buf.split_first()?;
        self.buf = rest;
        Some(*first)
    }

    fn string(&mut self) -> Option<&'a [u8]> {
        if self.buf.len() < 4 {
            return None;
        }
        let (len, rest) = self.buf.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return None;
        }
        let (value, rest) = rest.split_at(len);
        self.buf = rest;
        Some(value)
    }
}

#[cfg(test)]
pub(crate) fn userauth_blob(user: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let session_id = [0xABu8; 32];
    out.extend_from_slice(&(session_id.len() as u32).to_be_bytes());
    out.extend_from_slice(&session_id);
    out.push(SSH_MSG_USERAUTH_REQUEST);
    out.extend_from_slice(&(user.len() as u32).to_be_bytes());
    out.extend_from_slice(user.as_bytes());
    for field in ["ssh-connection", "publickey"] {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field.as_bytes());
    }
    out
}
