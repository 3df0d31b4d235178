//! byoc - on-demand remote desktops on user-owned VMs.
//!
//! A controller turns session lifecycle events into isolated worker units.
//! Each worker reaches its VM over SSH, starts a VNC display, tunnels it
//! locally, and bridges browsers to it over a websocket. The terminal
//! service multiplexes interactive shells over the same kind of SSH
//! connection.
//!
//! Neither `byoc` subcommand hosts the terminal service. It is a library
//! component: the embedding service process owns a
//! [`terminal::TerminalService`] and starts its
//! [`spawn_idle_sweeper`](terminal::TerminalService::spawn_idle_sweeper).

pub mod activity;
pub mod api;
pub mod bus;
pub mod config;
pub mod controller;
pub mod display;
pub mod events;
pub mod ports;
pub mod runtime;
pub mod shutdown;
pub mod ssh;
pub mod terminal;
pub mod tls;
pub mod tunnel;
pub mod worker;
