//! Concurrency and observation core for driving interactive command-line
//! devices (local shells, remote shells reached via ssh/telnet, serial AT
//! consoles, adb shells) over long-lived text connections.
//!
//! This crate covers the hard engineering underneath a test-automation
//! library for such devices: the connection/observer state machine, the
//! command future protocol, the data-distribution pipeline from a byte
//! stream to many concurrent observers, the runner that drives observers
//! to completion under a deadline, and the per-device state machine with
//! configured hop transitions between connection states.
//!
//! Deliberately out of scope: the catalog of concrete command/event
//! parsers (ping, ls, ssh, iperf2, AT+*, adb_shell, ...), the raw
//! transport bindings beyond one illustrative TCP adapter, configuration
//! *loading* (this crate consumes already-parsed [`config::Config`]
//! values, not YAML files), and CLI entry points.
//!
//! # Layout
//!
//! * [`connection`] — the abstract byte-oriented transport, [`RawConnection`].
//! * [`fanout`] — [`FanoutConnection`], multicasting one connection's
//!   inbound bytes to many observers.
//! * [`observer`] — the observer state machine, plus its `Command` and `Event` specializations.
//! * [`publisher`] — the in-process subject/subscriber primitive events and device state changes use.
//! * [`scheduler`] — the timing service backing observer timeouts.
//! * [`runner`] — drives observers from subscription to completion under a timeout.
//! * [`device`] — the per-target state machine binding a connection to a state-indexed command/event registry.
//! * [`config`] — typed configuration structures consumed, not parsed, by the core.
//! * [`logging`] — a `tracing-subscriber` layer builder matching spec.md's three log streams.
//! * [`testing`] — an in-crate `RawConnection` test double.

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod observer;
pub mod publisher;
pub mod runner;
pub mod scheduler;
pub mod testing;

pub use connection::{RawConnection, TcpRawConnection};
pub use device::{Device, DeviceBuilder, DeviceClassRegistry, DeviceFactory};
pub use error::{Error, Result};
pub use fanout::FanoutConnection;
pub use observer::{ObserverHandle, ObserverState};
pub use publisher::Publisher;
pub use runner::{PerObserverTaskRunner, Runner, SingleTaskRunner};
pub use scheduler::Scheduler;
