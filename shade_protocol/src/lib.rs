// shade_protocol — wire protocol for the Shade anonymizing router.
//
// This crate defines the id types, message enums, framing and session
// cryptography used by the router (`shade_router`) and its clients. It is
// shared by both sides and has no dependency on the router's registries.
//
// Module overview:
// - `types.rs`:    Id newtypes (`SessionId`, `ClientId`, `GroupId`, ...),
//                  `ChunkIndex`, and the size limits the router enforces.
// - `message.rs`:  `Request` and `Reply` enums plus their payload structs,
//                  including the `Delivery` entries queued in mailboxes.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream,
//                  and the `RequestFrame` / `ReplyFrame` transport frames.
// - `crypto.rs`:   Password-derived and negotiated AEAD ciphers, X25519 key
//                  exchange, handshake parameter validation.
//
// Design decisions:
// - **JSON serialization.** Frames and bodies are serde_json. Binary
//   framing can be swapped in later if bandwidth matters.
// - **Payloads as opaque `Vec<u8>`.** The router never inspects chat,
//   search or chunk payloads, only the routing fields around them.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`, so the
//   router can put native socket deadlines under every read and write.

pub mod crypto;
pub mod framing;
pub mod message;
pub mod types;

pub use crypto::{CipherKind, CryptoError, HashKind, KeyExchange, KeyParams, SessionCipher};
pub use framing::{
    MAX_MESSAGE_SIZE, ReplyFrame, RequestFrame, Status, read_frame, read_message, write_frame,
    write_message,
};
pub use message::{
    Chunk, ClientInfo, ClientReply, Delivery, DownloadMode, DownloadRequest, GroupRequest,
    JoinReply, JoinRequest, OpenRequest, Reply, Request, RoomInfo, RoomMode, RouterInfo,
    UploadRequest,
};
pub use types::{ChunkIndex, ClientId, GroupId, MessageId, RoomId, SessionId, TransferId};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Seal a request list the way a client does, frame it, and open it the
    /// way the router does.
    #[test]
    fn sealed_request_survives_framing() {
        let cipher = SessionCipher::from_password("pw");
        let requests = vec![
            Request::Ping { routers: true },
            Request::Group(GroupRequest {
                id: MessageId::new("m1"),
                room: Some(RoomId::new("r")),
                data: vec![1, 2, 3],
                ..GroupRequest::default()
            }),
        ];
        let body = cipher
            .encrypt(&serde_json::to_vec(&requests).unwrap())
            .unwrap();
        let frame = RequestFrame {
            session: Some(SessionId::new("s")),
            body,
        };

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).unwrap();
        let received: RequestFrame = read_frame(&mut Cursor::new(&wire)).unwrap();
        let plain = cipher.decrypt(&received.body).unwrap();
        let decoded: Vec<Request> = serde_json::from_slice(&plain).unwrap();
        assert_eq!(decoded, requests);
    }

    #[test]
    fn delivery_reply_roundtrip() {
        let reply = Reply::Delivery(Delivery::Group {
            id: MessageId::new("m1"),
            room: None,
            origin: ClientId::new("c1"),
            data: vec![9],
        });
        let json = serde_json::to_vec(&reply).unwrap();
        let back: Reply = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn cipher_names_on_the_wire() {
        let json = serde_json::to_string(&CipherKind::ChaCha20Poly1305).unwrap();
        assert_eq!(json, "\"chacha20-poly1305\"");
        let parsed: CipherKind = serde_json::from_str("\"chacha20-poly1305\"").unwrap();
        assert_eq!(parsed, CipherKind::ChaCha20Poly1305);
        let json = serde_json::to_string(&CipherKind::Aes128Gcm).unwrap();
        assert_eq!(json, "\"aes-128-gcm\"");
        let json = serde_json::to_string(&HashKind::Sha512).unwrap();
        assert_eq!(json, "\"sha512\"");
    }
}
