//! tether: keeps one MQTT session connected and its subscriptions alive.
//!
//! The binary reads a TOML configuration, sets up logging, creates a session
//! over the rumqttc transport, and supervises it: retries with backoff are
//! handled by [`tether_mqtt_session`], and the [`core::supervisor`] renews the
//! configured subscriptions after every reconnect.
//!
//! ## Modules
//!
//! * `config` — TOML configuration with `validator` checks.
//! * `core` — the subscription supervisor.
//! * `logger` — `tracing` subscriber setup (console and journald).
//!
//! ## Features
//!
//! * `tether-mqtt-rumqtt` — rumqttc transport (default: enabled).

pub mod config;
pub mod core;
pub mod logger;
