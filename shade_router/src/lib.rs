// shade_router — anonymizing relay router for group chat and file transfer.
//
// Clients never talk to each other directly. They open an encrypted session
// with a router, join a group (optionally a room within it), and the router
// fans their messages out to the other members' mailboxes, routes replies
// back to requesters, and relays file chunks between producers and
// consumers with bounded buffering. Payloads stay opaque to the router.
//
// Module overview:
// - `config.rs`:     `RouterConfig` (serde, JSON file) and timeouts.
// - `error.rs`:      `RouterError` and its mapping to wire statuses.
// - `logging.rs`:    tracing subscriber setup for the binary.
// - `session.rs`:    Per-client session: cipher, attributes, mute set,
//                    bounded mailbox, idle clock.
// - `group.rs`:      Groups (members, message dedup, names, rooms) and rooms.
// - `transfer.rs`:   Transfer relay and chunk flow control.
// - `federation.rs`: Peer routers, role rule, reachability probe.
// - `registry.rs`:   `Router`, owning all registries; session lifecycle and
//                    the sweep.
// - `command.rs`:    Frame dispatch and the command handlers.
// - `server.rs`:     Listener, reader threads, worker pool, sweeper thread.
//                    Uses `std::net` with native socket deadlines and a
//                    `crossbeam-channel` job queue.
// - `client.rs`:     Blocking `NetClient` used by tests and tools.
//
// Dependencies: `shade_protocol` (shared message types, framing, crypto).
//
// The router can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_router`).

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod federation;
pub mod group;
pub mod logging;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::RouterConfig;
pub use error::RouterError;
pub use server::{RouterHandle, start_router};
