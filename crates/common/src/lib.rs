//! Shared building blocks for the irrigation control loop: the
//! zone/field/sensor topology, the topic grammar, message payloads, the
//! backend and bus clients, and env-driven settings.

pub mod backend;
pub mod bus;
pub mod messages;
pub mod seed;
pub mod settings;
pub mod topics;
pub mod topology;
