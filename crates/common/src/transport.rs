//! Length-prefixed frames over a Unix domain socket
//!
//! Frame layout: u32 payload length, u16 protocol version, u16 frame kind,
//! then the payload, all little-endian. A frame carries at most one file
//! descriptor, sent as SCM_RIGHTS ancillary data alongside the frame's first
//! byte. The reader tracks the byte range of each read that delivered
//! descriptors so they stay attached to the frame that sent them even when
//! several frames coalesce into one read.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::trace;

use crate::constants::{
    FRAME_HEADER_BYTES, MAX_FDS_PER_FRAME, MAX_FRAME_PAYLOAD_BYTES, PROTOCOL_VERSION,
};
use crate::error::{RelayError, Result};
use crate::protocol::message::{FrameKind, Message};

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// A raw frame as read off the socket
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Split a connected stream into a frame reader and writer
pub fn frame_pair(stream: UnixStream) -> (FrameReader, FrameWriter) {
    let stream = Arc::new(stream);
    (
        FrameReader {
            stream: Arc::clone(&stream),
            buf: Vec::new(),
            consumed: 0,
            fd_markers: VecDeque::new(),
        },
        FrameWriter { stream },
    )
}

/// Writes frames to the socket
pub struct FrameWriter {
    stream: Arc<UnixStream>,
}

impl FrameWriter {
    /// Encode and send one message
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        let (kind, payload, fds) = msg.encode()?;
        self.send_frame(kind, payload, fds).await
    }

    async fn send_frame(
        &mut self,
        kind: FrameKind,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD_BYTES {
            return Err(RelayError::InvalidMessage(format!(
                "frame payload of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_FRAME_PAYLOAD_BYTES
            )));
        }
        if fds.len() > MAX_FDS_PER_FRAME {
            return Err(RelayError::InvalidMessage(format!(
                "frame carries {} descriptors, at most {} allowed",
                fds.len(),
                MAX_FDS_PER_FRAME
            )));
        }

        let mut bytes = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        bytes.extend_from_slice(&kind.to_u16().to_le_bytes());
        bytes.extend_from_slice(&payload);

        trace!(?kind, len = payload.len(), fds = fds.len(), "sending frame");

        let mut sent = 0usize;
        let mut fds_pending = fds;
        while sent < bytes.len() {
            let raw_fds: Vec<RawFd> = fds_pending.iter().map(AsRawFd::as_raw_fd).collect();
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(&bytes[sent..])];
                    let cmsgs = if raw_fds.is_empty() {
                        Vec::new()
                    } else {
                        vec![ControlMessage::ScmRights(&raw_fds)]
                    };
                    match sendmsg::<UnixAddr>(
                        self.stream.as_raw_fd(),
                        &iov,
                        &cmsgs,
                        MsgFlags::empty(),
                        None,
                    ) {
                        Ok(n) => Ok(n),
                        Err(Errno::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
                        Err(e) => Err(io::Error::from(e)),
                    }
                })
                .await?;
            if n > 0 {
                // Ancillary data went out with the first transmitted byte;
                // continuation writes must not repeat it
                fds_pending.clear();
            }
            sent += n;
        }
        Ok(())
    }
}

/// Reads frames from the socket
pub struct FrameReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
    /// Absolute stream offset of the first byte in `buf`
    consumed: u64,
    /// Received descriptors keyed by the byte range of the read that
    /// delivered them
    fd_markers: VecDeque<(u64, u64, Vec<OwnedFd>)>,
}

impl FrameReader {
    /// Receive and decode the next message; `None` on clean end of stream
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.recv_frame().await? {
            Some(frame) => Ok(Some(Message::decode(
                frame.kind,
                &frame.payload,
                frame.fds,
            )?)),
            None => Ok(None),
        }
    }

    /// Receive the next raw frame; `None` on clean end of stream
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_buffered()? {
                return Ok(Some(frame));
            }
            let n = self.fill().await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RelayError::ConnectionError(
                    "connection closed mid-frame".to_string(),
                ));
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[0..4]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;
        let mut short = [0u8; 2];
        short.copy_from_slice(&self.buf[4..6]);
        let version = u16::from_le_bytes(short);
        short.copy_from_slice(&self.buf[6..8]);
        let kind_raw = u16::from_le_bytes(short);

        if version != PROTOCOL_VERSION {
            return Err(RelayError::InvalidMessage(format!(
                "unsupported frame version {version}"
            )));
        }
        if payload_len > MAX_FRAME_PAYLOAD_BYTES {
            return Err(RelayError::InvalidMessage(format!(
                "frame payload of {payload_len} bytes exceeds {MAX_FRAME_PAYLOAD_BYTES} byte limit"
            )));
        }
        let kind = FrameKind::from_u16(kind_raw).ok_or_else(|| {
            RelayError::InvalidMessage(format!("unknown frame kind {kind_raw}"))
        })?;

        let frame_len = FRAME_HEADER_BYTES + payload_len;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let payload = self.buf[FRAME_HEADER_BYTES..frame_len].to_vec();
        self.buf.drain(..frame_len);
        let frame_start = self.consumed;
        let frame_end = frame_start + frame_len as u64;
        self.consumed = frame_end;

        // A read ends at the segment that carried its ancillary data, so a
        // marker's end offset falls inside exactly one frame: that frame owns
        // the descriptors, not an earlier frame glued into the same read.
        let mut fds = Vec::new();
        while self
            .fd_markers
            .front()
            .is_some_and(|(_, end, _)| frame_start < *end && *end <= frame_end)
        {
            if let Some((_, _, batch)) = self.fd_markers.pop_front() {
                fds.extend(batch);
            }
        }
        if fds.len() > MAX_FDS_PER_FRAME {
            return Err(RelayError::InvalidMessage(format!(
                "frame carries {} descriptors, at most {} allowed",
                fds.len(),
                MAX_FDS_PER_FRAME
            )));
        }

        trace!(?kind, len = payload_len, fds = fds.len(), "received frame");
        Ok(Some(Frame { kind, payload, fds }))
    }

    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let arrival_offset = self.consumed + self.buf.len() as u64;

        let (n, fds) = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut cmsg_buf = cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
                let mut iov = [IoSliceMut::new(&mut chunk)];
                match recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => {
                        if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                            return Err(io::Error::other("ancillary data truncated"));
                        }
                        let mut fds = Vec::new();
                        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                                for fd in raw {
                                    // Safety: SCM_RIGHTS hands us ownership of
                                    // each received descriptor
                                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                                }
                            }
                        }
                        Ok((msg.bytes, fds))
                    }
                    Err(Errno::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
                    Err(e) => Err(io::Error::from(e)),
                }
            })
            .await?;

        self.buf.extend_from_slice(&chunk[..n]);
        if !fds.is_empty() {
            self.fd_markers
                .push_back((arrival_offset, arrival_offset + n as u64, fds));
        }
        Ok(n)
    }
}
