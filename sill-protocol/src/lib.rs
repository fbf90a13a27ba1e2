//! Control-channel wire protocol between a render target and its host.
//!
//! The channel carries exactly one message kind: a surface-ready
//! announcement emitted right after a target's drawable is created. There is
//! no acknowledgement and no further opcodes.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{MsgFlags, send};
use thiserror::Error;
use tracing::trace;

/// Opcode announcing that a target's drawable exists and can be composited.
pub const SURFACE_READY: u32 = 0x42;

/// Size in bytes of one encoded control message.
pub const MESSAGE_SIZE: usize = 8;

/// Errors produced by control-channel encoding and I/O.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("control message truncated: got {0} bytes, need {MESSAGE_SIZE}")]
	Truncated(usize),
	#[error("unknown control opcode {0:#x}")]
	UnknownOpcode(u32),
	#[error("control socket setup failed: {0}")]
	Setup(std::io::Error),
	#[error("control send failed: {0}")]
	Send(nix::errno::Errno),
	#[error("control send wrote {0} of {MESSAGE_SIZE} bytes")]
	ShortWrite(usize),
}

/// Fixed two-word control record.
///
/// Both words are native-endian `u32`: the opcode, then the surface's
/// protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
	/// Message opcode; the only defined value is [`SURFACE_READY`].
	pub opcode: u32,
	/// Protocol identifier of the announced surface.
	pub surface_id: u32,
}

impl ControlMessage {
	/// Builds the surface-ready announcement for a surface.
	pub fn surface_ready(surface_id: u32) -> Self {
		Self {
			opcode: SURFACE_READY,
			surface_id,
		}
	}

	/// Encodes the message into its 8-byte wire form.
	pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
		let mut bytes = [0u8; MESSAGE_SIZE];
		bytes[..4].copy_from_slice(&self.opcode.to_ne_bytes());
		bytes[4..].copy_from_slice(&self.surface_id.to_ne_bytes());
		bytes
	}

	/// Decodes one message from the start of `bytes`.
	pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
		if bytes.len() < MESSAGE_SIZE {
			return Err(ProtocolError::Truncated(bytes.len()));
		}
		let opcode = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
		let surface_id = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
		if opcode != SURFACE_READY {
			return Err(ProtocolError::UnknownOpcode(opcode));
		}
		Ok(Self { opcode, surface_id })
	}
}

/// Non-blocking wrapper around the host-provided control socket.
///
/// Sends are attempt-once: the caller decides whether a failure matters.
#[derive(Debug)]
pub struct ControlChannel {
	socket: UnixStream,
}

impl ControlChannel {
	/// Takes ownership of a connected socket fd and switches it to
	/// non-blocking mode.
	pub fn from_fd(fd: OwnedFd) -> Result<Self, ProtocolError> {
		let socket = UnixStream::from(fd);
		socket.set_nonblocking(true).map_err(ProtocolError::Setup)?;
		Ok(Self { socket })
	}

	/// Sends one message without blocking and without retrying.
	pub fn send(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
		let bytes = message.encode();
		let sent = send(
			self.socket.as_raw_fd(),
			&bytes,
			MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
		)
		.map_err(ProtocolError::Send)?;
		if sent != MESSAGE_SIZE {
			return Err(ProtocolError::ShortWrite(sent));
		}
		trace!(opcode = message.opcode, surface_id = message.surface_id, "control message sent");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::io::Read;
	use std::os::fd::OwnedFd;
	use std::os::unix::net::UnixStream;

	use super::{ControlChannel, ControlMessage, MESSAGE_SIZE, ProtocolError, SURFACE_READY};

	#[test]
	fn encode_decode_roundtrip() {
		let message = ControlMessage::surface_ready(17);
		let bytes = message.encode();
		assert_eq!(bytes.len(), MESSAGE_SIZE);
		let decoded = ControlMessage::decode(&bytes).expect("decode");
		assert_eq!(decoded, message);
		assert_eq!(decoded.opcode, SURFACE_READY);
		assert_eq!(decoded.surface_id, 17);
	}

	#[test]
	fn decode_rejects_short_input() {
		let err = ControlMessage::decode(&[0x42, 0, 0]).expect_err("short input");
		assert!(matches!(err, ProtocolError::Truncated(3)));
	}

	#[test]
	fn decode_rejects_unknown_opcode() {
		let mut bytes = ControlMessage::surface_ready(1).encode();
		bytes[..4].copy_from_slice(&0x41u32.to_ne_bytes());
		let err = ControlMessage::decode(&bytes).expect_err("unknown opcode");
		assert!(matches!(err, ProtocolError::UnknownOpcode(0x41)));
	}

	#[test]
	fn send_delivers_wire_bytes() {
		let (ours, theirs) = UnixStream::pair().expect("socketpair");
		let channel = ControlChannel::from_fd(OwnedFd::from(ours)).expect("channel");
		channel
			.send(&ControlMessage::surface_ready(33))
			.expect("send");

		let mut theirs = theirs;
		let mut bytes = [0u8; MESSAGE_SIZE];
		theirs.read_exact(&mut bytes).expect("read");
		let message = ControlMessage::decode(&bytes).expect("decode");
		assert_eq!(message.opcode, SURFACE_READY);
		assert_eq!(message.surface_id, 33);
	}

	#[test]
	fn send_to_closed_peer_errors_without_signal() {
		let (ours, theirs) = UnixStream::pair().expect("socketpair");
		drop(theirs);
		let channel = ControlChannel::from_fd(OwnedFd::from(ours)).expect("channel");
		let err = channel
			.send(&ControlMessage::surface_ready(1))
			.expect_err("peer is gone");
		assert!(matches!(err, ProtocolError::Send(_)));
	}
}
