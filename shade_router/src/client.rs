// Blocking TCP client for the router.
//
// The protocol is strictly request/reply: every `RequestFrame` gets exactly
// one `ReplyFrame`, and deliveries queued by other members ride along at
// the front of whatever reply comes next. `NetClient` therefore needs no
// reader thread: each call writes one frame and reads one frame on the
// calling thread. Deliveries are split off into an inbox that `poll()` and
// `take_deliveries()` hand out.
//
// `connect()` performs the handshake: an `Open` sealed with the password
// cipher, then key derivation from the router's public key. Every later
// frame carries the session id and uses the negotiated cipher.
//
// `open_tunnel()` opens a second connection for the same session and parks
// it with a `Tunnel` request. The router then pushes deliveries over it as
// they arrive; `TunnelClient::recv` reads one push and acks it.
//
// This module lives in the router crate so integration tests and tools can
// drive a router without any other dependency.

use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use shade_protocol::{
    Chunk, ChunkIndex, ClientId, ClientInfo, ClientReply, CryptoError, Delivery, DownloadMode,
    DownloadRequest, GroupRequest, JoinReply, JoinRequest, KeyExchange, KeyParams, MessageId,
    OpenRequest, Reply, ReplyFrame, Request, RequestFrame, RoomInfo, RoomMode, RouterInfo,
    SessionCipher, SessionId, Status, TransferId, UploadRequest, read_frame, write_frame,
};
use thiserror::Error;

/// Read deadline for a reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("router answered {status:?}")]
    Status {
        status: Status,
        location: Option<String>,
    },

    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct NetClient {
    peer: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    password: String,
    session: SessionId,
    client: ClientId,
    cipher: SessionCipher,
    inbox: Vec<Delivery>,
}

impl NetClient {
    /// Connect and handshake with default key parameters.
    pub fn connect(addr: impl ToSocketAddrs, password: &str) -> Result<Self> {
        Self::connect_with(addr, password, KeyParams::default())
    }

    /// Connect and handshake with the given key parameters.
    pub fn connect_with(
        addr: impl ToSocketAddrs,
        password: &str,
        params: KeyParams,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        let password_cipher = SessionCipher::from_password(password);
        let mut client = Self {
            peer,
            reader,
            writer,
            password: password.to_string(),
            session: SessionId::default(),
            client: ClientId::default(),
            cipher: password_cipher.clone(),
            inbox: Vec::new(),
        };

        let exchange = KeyExchange::new();
        let open = open_request(exchange.public_key(), &params);
        let frame = RequestFrame {
            session: None,
            body: seal(&password_cipher, &[Request::Open(open)])?,
        };
        let replies = client.exchange(&frame, &password_cipher)?;
        let (session, id, public_key) = match replies.as_slice() {
            [
                Reply::Open {
                    session,
                    client,
                    public_key,
                },
            ] => (session.clone(), client.clone(), *public_key),
            other => return Err(ClientError::Unexpected(format!("{other:?}"))),
        };

        client.cipher = SessionCipher::derive(&exchange.agree(public_key), password, &params)?;
        client.session = session;
        client.client = id;
        Ok(client)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client
    }

    /// Send a batch of requests. Deliveries are moved to the inbox; the
    /// remaining replies are returned in order.
    pub fn request(&mut self, requests: &[Request]) -> Result<Vec<Reply>> {
        let frame = RequestFrame {
            session: Some(self.session.clone()),
            body: seal(&self.cipher, requests)?,
        };
        let cipher = self.cipher.clone();
        let replies = self.exchange(&frame, &cipher)?;
        let mut answers = Vec::new();
        for reply in replies {
            match reply {
                Reply::Delivery(delivery) => self.inbox.push(delivery),
                other => answers.push(other),
            }
        }
        Ok(answers)
    }

    /// Write any frame and read the raw reply.
    pub fn send_raw(&mut self, frame: &RequestFrame) -> Result<ReplyFrame> {
        write_frame(&mut self.writer, frame)?;
        Ok(read_frame(&mut self.reader)?)
    }

    fn exchange(&mut self, frame: &RequestFrame, cipher: &SessionCipher) -> Result<Vec<Reply>> {
        let reply = self.send_raw(frame)?;
        if !reply.status.is_success() {
            return Err(ClientError::Status {
                status: reply.status,
                location: reply.location,
            });
        }
        let plain = cipher.decrypt(&reply.body)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Negotiate a new session key. The session id changes.
    pub fn rekey(&mut self, params: KeyParams) -> Result<()> {
        let exchange = KeyExchange::new();
        let open = open_request(exchange.public_key(), &params);
        let replies = self.request(&[Request::Open(open)])?;
        let (session, public_key) = match replies.as_slice() {
            [Reply::Open {
                session,
                public_key,
                ..
            }] => (session.clone(), *public_key),
            other => return Err(ClientError::Unexpected(format!("{other:?}"))),
        };
        self.cipher =
            SessionCipher::derive(&exchange.agree(public_key), &self.password, &params)?;
        self.session = session;
        Ok(())
    }

    pub fn ping(&mut self, routers: bool) -> Result<Vec<RouterInfo>> {
        match self.single(Request::Ping { routers })? {
            Reply::Pong { routers } => Ok(routers),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn entropy(&mut self, size: u32) -> Result<Vec<u8>> {
        match self.single(Request::Entropy { size })? {
            Reply::Entropy { data } => Ok(data),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn join(&mut self, request: JoinRequest) -> Result<JoinReply> {
        match self.single(Request::Join(request))? {
            Reply::Join(reply) => Ok(reply),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn room(&mut self, mode: RoomMode) -> Result<(Vec<ClientInfo>, Vec<RoomInfo>)> {
        match self.single(Request::Room(mode))? {
            Reply::Room { clients, rooms } => Ok((clients, rooms)),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn mute(&mut self, client: ClientId, muted: bool) -> Result<()> {
        self.request(&[Request::Mute { client, muted }])?;
        Ok(())
    }

    pub fn send_group(&mut self, message: GroupRequest) -> Result<()> {
        self.request(&[Request::Group(message)])?;
        Ok(())
    }

    pub fn send_reply(&mut self, id: MessageId, data: Vec<u8>) -> Result<()> {
        let reply = ClientReply {
            id,
            data,
            ..ClientReply::default()
        };
        self.request(&[Request::Client(reply)])?;
        Ok(())
    }

    /// Consumer poll. Returns `Reply::Download` or `Reply::Stopped`.
    pub fn download(
        &mut self,
        id: TransferId,
        chunks: impl IntoIterator<Item = ChunkIndex>,
    ) -> Result<Reply> {
        self.single(Request::Download(DownloadRequest {
            id,
            mode: DownloadMode::None,
            chunks: chunks.into_iter().collect(),
        }))
    }

    /// Cancel a transfer.
    pub fn cancel_download(&mut self, id: TransferId) -> Result<Reply> {
        self.single(Request::Download(DownloadRequest {
            id,
            mode: DownloadMode::Remove,
            chunks: Default::default(),
        }))
    }

    /// Producer poll. Returns `Reply::Upload` or `Reply::Stopped`.
    pub fn upload(&mut self, id: TransferId, chunk: Option<Chunk>) -> Result<Reply> {
        self.single(Request::Upload(UploadRequest { id, chunk }))
    }

    /// Ask the router for queued deliveries and return everything in the
    /// inbox.
    pub fn poll(&mut self) -> Result<Vec<Delivery>> {
        self.request(&[Request::Ping { routers: false }])?;
        Ok(self.take_deliveries())
    }

    /// Drain deliveries already received.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.inbox)
    }

    /// Open a push channel for this session on a second connection. Pushes
    /// are sealed with the session cipher current at the time, so reopen
    /// the tunnel after `rekey`.
    pub fn open_tunnel(&self) -> Result<TunnelClient> {
        let stream = TcpStream::connect(self.peer)?;
        stream.set_nodelay(true)?;
        let mut tunnel = TunnelClient {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            cipher: self.cipher.clone(),
            backlog: Vec::new(),
        };
        let frame = RequestFrame {
            session: Some(self.session.clone()),
            body: seal(&self.cipher, &[Request::Tunnel])?,
        };
        write_frame(&mut tunnel.writer, &frame)?;
        let reply: ReplyFrame = read_frame(&mut tunnel.reader)?;
        tunnel.backlog = tunnel.open(reply)?;
        Ok(tunnel)
    }

    /// Leave the router. The connection is closed by the router.
    pub fn quit(mut self) -> Result<Vec<Delivery>> {
        self.request(&[Request::Quit])?;
        Ok(self.take_deliveries())
    }

    fn single(&mut self, request: Request) -> Result<Reply> {
        let mut replies = self.request(&[request])?;
        match replies.len() {
            1 => Ok(replies.remove(0)),
            _ => Err(ClientError::Unexpected(format!("{replies:?}"))),
        }
    }
}

fn open_request(public_key: [u8; 32], params: &KeyParams) -> OpenRequest {
    OpenRequest {
        public_key,
        cipher: params.cipher,
        key_size: params.key_size,
        hash: params.hash,
        iterations: params.iterations,
        salt: params.salt.clone(),
    }
}

fn seal(cipher: &SessionCipher, requests: &[Request]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(requests)?;
    Ok(cipher.encrypt(&json)?)
}

/// Receiving end of a tunnel opened with `NetClient::open_tunnel`.
pub struct TunnelClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    cipher: SessionCipher,
    backlog: Vec<Delivery>,
}

impl TunnelClient {
    /// Wait up to `timeout` for the next push, ack it and return its
    /// deliveries. Returns an empty list if nothing arrived in time.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<Delivery>> {
        if !self.backlog.is_empty() {
            return Ok(std::mem::take(&mut self.backlog));
        }
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let frame: ReplyFrame = match read_frame(&mut self.reader) {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let deliveries = self.open(frame)?;
        write_frame(&mut self.writer, &ReplyFrame::status(Status::Ok))?;
        Ok(deliveries)
    }

    fn open(&self, frame: ReplyFrame) -> Result<Vec<Delivery>> {
        if !frame.status.is_success() {
            return Err(ClientError::Status {
                status: frame.status,
                location: frame.location,
            });
        }
        let plain = self.cipher.decrypt(&frame.body)?;
        let replies: Vec<Reply> = serde_json::from_slice(&plain)?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Delivery(delivery) => Ok(delivery),
                other => Err(ClientError::Unexpected(format!("{other:?}"))),
            })
            .collect()
    }
}
