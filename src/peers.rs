use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, Framed};
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    piece::{Block, DataBlock},
    protocol::{HandShake, MessageFramer, PeerMessage},
};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("info hash mismatch")]
    InfoHashMismatch,
}

impl From<std::io::Error> for PeerError {
    fn from(_: std::io::Error) -> Self {
        Self::Disconnected
    }
}

impl PeerError {
    /// Framed surfaces io failures and decode failures through one error
    /// type; pull them apart again.
    fn from_stream(error: anyhow::Error) -> Self {
        if error.downcast_ref::<std::io::Error>().is_some() {
            Self::Disconnected
        } else {
            Self::Malformed(error.to_string())
        }
    }
}

/// Swarm to session instructions. Every command maps to exactly one wire
/// frame except `Shutdown`, which ends the session task.
#[derive(Debug)]
pub enum SessionCommand {
    Request(Block),
    Block(DataBlock),
    Have(u32),
    Bitfield(BitField),
    Interested,
    NotInterested,
    Choke,
    Unchoke,
    KeepAlive,
    Shutdown,
}

#[derive(Debug)]
pub struct SessionEvent {
    pub session: Uuid,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(BitField),
    BlockRequested(Block),
    BlockReceived(DataBlock),
}

/// Protocol state machine for one connected peer. Owns the socket; the
/// swarm reaches it only through its command channel.
#[derive(Debug)]
pub struct PeerSession {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub remote_peer_id: [u8; 20],
    stream: Framed<TcpStream, MessageFramer>,
    pub bitfield: BitField,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub last_seen: Instant,
    num_pieces: usize,
    received_any: bool,
}

impl PeerSession {
    /// Dial side of the handshake: send ours, then read and check theirs.
    pub async fn connect(
        mut socket: TcpStream,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        num_pieces: usize,
    ) -> Result<Self, PeerError> {
        let addr = socket.peer_addr()?;
        let my_handshake = HandShake::new(info_hash, local_peer_id).as_bytes();
        socket.write_all(&my_handshake).await?;
        socket.flush().await?;

        let mut response = [0_u8; HandShake::SIZE];
        socket.read_exact(&mut response).await?;
        let his_handshake =
            HandShake::from_bytes(&response).map_err(|e| PeerError::Malformed(e.to_string()))?;
        if his_handshake.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(Self::from_parts(socket, addr, his_handshake, num_pieces))
    }

    /// Listen side of the handshake: read theirs first, reject foreign info
    /// hashes, then answer.
    pub async fn accept(
        mut socket: TcpStream,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        num_pieces: usize,
    ) -> Result<Self, PeerError> {
        let addr = socket.peer_addr()?;
        let mut incoming = [0_u8; HandShake::SIZE];
        socket.read_exact(&mut incoming).await?;
        let his_handshake =
            HandShake::from_bytes(&incoming).map_err(|e| PeerError::Malformed(e.to_string()))?;
        if his_handshake.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        let my_handshake = HandShake::new(info_hash, local_peer_id).as_bytes();
        socket.write_all(&my_handshake).await?;
        socket.flush().await?;

        Ok(Self::from_parts(socket, addr, his_handshake, num_pieces))
    }

    fn from_parts(
        socket: TcpStream,
        addr: SocketAddr,
        his_handshake: HandShake,
        num_pieces: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            remote_peer_id: his_handshake.peer_id,
            stream: Framed::new(socket, MessageFramer),
            bitfield: BitField::empty(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            last_seen: Instant::now(),
            num_pieces,
            received_any: false,
        }
    }

    /// Emit exactly one frame, flushed before returning.
    pub async fn send(&mut self, message: PeerMessage) -> Result<(), PeerError> {
        match &message {
            PeerMessage::Choke => self.am_choking = true,
            PeerMessage::Unchoke => self.am_choking = false,
            PeerMessage::Interested => self.am_interested = true,
            PeerMessage::NotInterested => self.am_interested = false,
            _ => {}
        }
        let mut framer = MessageFramer;
        let mut buf = BytesMut::new();
        framer
            .encode(message, &mut buf)
            .map_err(|e| PeerError::Malformed(e.to_string()))?;
        let socket = self.stream.get_mut();
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Read one frame and update the session state it affects.
    pub async fn next_message(&mut self) -> Result<PeerMessage, PeerError> {
        let message = match self.stream.next().await {
            None => return Err(PeerError::Disconnected),
            Some(Err(e)) => return Err(PeerError::from_stream(e)),
            Some(Ok(message)) => message,
        };
        self.apply(&message)?;
        Ok(message)
    }

    fn apply(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        self.last_seen = Instant::now();
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.peer_choking = true,
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { index } => {
                if self.bitfield.add(*index as usize).is_err() {
                    tracing::warn!(peer = %self.addr, "Have for nonexistent piece {index}");
                }
            }
            PeerMessage::Bitfield { payload } => {
                if self.received_any {
                    return Err(PeerError::Malformed(
                        "bitfield is only allowed as the first message".into(),
                    ));
                }
                payload
                    .validate(self.num_pieces)
                    .map_err(|e| PeerError::Malformed(e.to_string()))?;
                self.bitfield = payload.clone();
            }
            PeerMessage::Request { .. } | PeerMessage::Piece { .. } | PeerMessage::Cancel { .. } => {}
        }
        self.received_any = true;
        Ok(())
    }

    /// Session task body: pump swarm commands out and peer messages in until
    /// either side goes away.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Uuid, Result<(), PeerError>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Shutdown) => return (self.id, Ok(())),
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                return (self.id, Err(e));
                            }
                        }
                    }
                }
                message = self.next_message() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => return (self.id, Err(e)),
                    };
                    tracing::trace!(peer = %self.addr, "Peer sent {message}");
                    if let Some(kind) = event_kind(message) {
                        let event = SessionEvent { session: self.id, kind };
                        if events.send(event).await.is_err() {
                            return (self.id, Ok(()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), PeerError> {
        let message = match command {
            SessionCommand::Request(block) => PeerMessage::request(block),
            SessionCommand::Block(data) => PeerMessage::piece(data),
            SessionCommand::Have(index) => PeerMessage::Have { index },
            SessionCommand::Bitfield(payload) => PeerMessage::Bitfield { payload },
            SessionCommand::Interested => PeerMessage::Interested,
            SessionCommand::NotInterested => PeerMessage::NotInterested,
            SessionCommand::Choke => PeerMessage::Choke,
            SessionCommand::Unchoke => PeerMessage::Unchoke,
            SessionCommand::KeepAlive => PeerMessage::KeepAlive,
            SessionCommand::Shutdown => unreachable!("shutdown is handled by the run loop"),
        };
        self.send(message).await
    }
}

fn event_kind(message: PeerMessage) -> Option<SessionEventKind> {
    match message {
        PeerMessage::KeepAlive => None,
        PeerMessage::Choke => Some(SessionEventKind::Choked),
        PeerMessage::Unchoke => Some(SessionEventKind::Unchoked),
        PeerMessage::Interested => Some(SessionEventKind::Interested),
        PeerMessage::NotInterested => Some(SessionEventKind::NotInterested),
        PeerMessage::Have { index } => Some(SessionEventKind::Have(index)),
        PeerMessage::Bitfield { payload } => Some(SessionEventKind::Bitfield(payload)),
        PeerMessage::Request {
            index,
            begin,
            length,
        } => Some(SessionEventKind::BlockRequested(Block {
            piece: index,
            offset: begin,
            length,
        })),
        PeerMessage::Piece {
            index,
            begin,
            block,
        } => Some(SessionEventKind::BlockReceived(DataBlock::new(
            index, begin, block,
        ))),
        // served blocks go out as soon as the request arrives, there is
        // nothing in flight to cancel
        PeerMessage::Cancel { .. } => None,
    }
}
