//! Passing tokens together with their descriptors over Unix domain sockets.
//!
//! A [`TransferableToken`] names a descriptor in the exporting process. Peers that
//! cannot fetch that descriptor directly (see
//! [`SharedMemory::from_process`](vmfabric_page_alloc::shared_memory::SharedMemory::from_process))
//! can receive a copy of it through `SCM_RIGHTS` instead. The receiving side gets
//! a token rewritten to name the received descriptor, which stays open for as
//! long as the [`ReceivedToken`] lives.

use std::{
    io::{IoSlice, IoSliceMut},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use vmfabric_common::{Result, error::Error};

use crate::token::TransferableToken;

/// A token received from a peer, together with the descriptor it now refers to.
#[derive(Debug)]
pub struct ReceivedToken {
    token: TransferableToken,
    _fd: OwnedFd,
}

impl ReceivedToken {
    /// The token, valid for import while `self` is alive.
    pub fn token(&self) -> &TransferableToken {
        &self.token
    }
}

fn invalid_message(operation: &str, kind: std::io::ErrorKind, message: &str) -> Error {
    Error::io(operation, std::io::Error::new(kind, message.to_string()))
}

/// Sends `token` and a duplicate of its descriptor to the peer of `stream`.
/// The token must have been exported by this process.
pub fn send_token(stream: &UnixStream, token: &TransferableToken) -> Result<()> {
    if token.owner_pid != std::process::id() {
        return Err(Error::invalid_arg(
            "token",
            format!("exported by pid {}, not by this process", token.owner_pid),
        ));
    }
    let payload = token.to_bytes()?;
    let fds = [token.fd];
    let sent = sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &[IoSlice::new(&payload)],
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )
    .map_err(|e| Error::io("send_token", e.into()))?;
    if sent != payload.len() {
        return Err(invalid_message(
            "send_token",
            std::io::ErrorKind::WriteZero,
            "short write",
        ));
    }
    log::debug!("sent token for fd {} over {:?}", token.fd, stream);
    Ok(())
}

/// Receives one token sent with [`send_token`].
pub fn recv_token(stream: &UnixStream) -> Result<ReceivedToken> {
    let mut payload = [0u8; TransferableToken::ENCODED_LEN];
    let mut control = nix::cmsg_space!(RawFd);

    let (received, truncated, mut fds) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut control),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|e| Error::io("recv_token", e.into()))?;

        // Take ownership of every received descriptor first so that they are
        // closed on each error path below.
        let mut fds = Vec::new();
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
        }
        (
            msg.bytes,
            msg.flags.contains(MsgFlags::MSG_CTRUNC),
            fds,
        )
    };

    if truncated {
        return Err(invalid_message(
            "recv_token",
            std::io::ErrorKind::InvalidData,
            "control data truncated",
        ));
    }
    if fds.len() != 1 {
        return Err(invalid_message(
            "recv_token",
            std::io::ErrorKind::InvalidData,
            "message must carry exactly one descriptor",
        ));
    }
    let fd = fds.swap_remove(0);
    if received != payload.len() {
        return Err(invalid_message(
            "recv_token",
            std::io::ErrorKind::UnexpectedEof,
            "short token message",
        ));
    }

    let mut token = TransferableToken::from_bytes(&payload)?;
    token.owner_pid = std::process::id();
    token.fd = fd.as_raw_fd();
    Ok(ReceivedToken { token, _fd: fd })
}
